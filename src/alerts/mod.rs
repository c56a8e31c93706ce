use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;

const HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AlertPriority {
    Info,
    Warning,
    High,
    Critical,
}

/// Structured event handed to every channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub title: String,
    pub message: String,
    pub priority: AlertPriority,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(title: impl Into<String>, message: impl Into<String>, priority: AlertPriority) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            priority,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook returned {0}")]
    Status(u16),

    #[error("channel {0} timed out")]
    Timeout(String),
}

/// One delivery target
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// Writes alerts to the log at a level matching their priority
pub struct LogChannel;

#[async_trait]
impl AlertChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        match alert.priority {
            AlertPriority::Info => {
                tracing::info!(metadata = ?alert.metadata, "📣 {}: {}", alert.title, alert.message)
            }
            AlertPriority::Warning => {
                tracing::warn!(metadata = ?alert.metadata, "⚠️  {}: {}", alert.title, alert.message)
            }
            AlertPriority::High | AlertPriority::Critical => {
                tracing::error!(metadata = ?alert.metadata, "🚨 {}: {}", alert.title, alert.message)
            }
        }
        Ok(())
    }
}

/// Posts the alert as JSON to a URL
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl AlertChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        let response = self.client.post(&self.url).json(alert).send().await?;
        if !response.status().is_success() {
            return Err(AlertError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Fans alerts out to every channel concurrently
///
/// Delivery is best effort: each channel gets its own timeout and a failing
/// channel never holds up the others.
pub struct AlertDispatcher {
    channels: Vec<Arc<dyn AlertChannel>>,
    channel_timeout: Duration,
    history: Mutex<VecDeque<Alert>>,
}

impl AlertDispatcher {
    pub fn new(channels: Vec<Arc<dyn AlertChannel>>, channel_timeout: Duration) -> Self {
        Self {
            channels,
            channel_timeout,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
        }
    }

    /// Dispatcher that only logs
    pub fn log_only() -> Self {
        Self::new(vec![Arc::new(LogChannel)], Duration::from_secs(5))
    }

    /// Deliver to all channels; returns how many succeeded
    pub async fn send(&self, alert: Alert) -> usize {
        {
            let mut history = self.history.lock();
            if history.len() == HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(alert.clone());
        }

        let alert = Arc::new(alert);
        let mut deliveries = JoinSet::new();
        for channel in &self.channels {
            let channel = Arc::clone(channel);
            let alert = Arc::clone(&alert);
            let timeout = self.channel_timeout;
            deliveries.spawn(async move {
                let name = channel.name().to_string();
                let result = match tokio::time::timeout(timeout, channel.send(&alert)).await {
                    Ok(result) => result,
                    Err(_) => Err(AlertError::Timeout(name.clone())),
                };
                (name, result)
            });
        }

        let mut delivered = 0;
        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok((_, Ok(()))) => delivered += 1,
                Ok((name, Err(e))) => tracing::warn!(channel = %name, "Alert delivery failed: {}", e),
                Err(e) => tracing::warn!("Alert task failed: {}", e),
            }
        }
        delivered
    }

    /// Most recent alerts, newest last
    pub fn recent(&self, count: usize) -> Vec<Alert> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(count);
        history.iter().skip(skip).cloned().collect()
    }
}
