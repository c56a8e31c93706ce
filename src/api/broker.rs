use crate::models::{Account, Bar, Order, OrderRequest, Position, Quote};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a broker collaborator
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("broker call timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited by broker")]
    RateLimited,

    #[error("broker server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl BrokerError {
    /// Timeouts, network failures, throttling and 5xx responses
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Timeout(_)
                | BrokerError::Network(_)
                | BrokerError::RateLimited
                | BrokerError::Server { .. }
        )
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            BrokerError::Decode(e.to_string())
        } else {
            BrokerError::Network(e.to_string())
        }
    }
}

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Trading and market data surface of the broker
///
/// The engine treats implementations as the source of truth for positions
/// and orders.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    async fn submit_order(&self, request: &OrderRequest) -> BrokerResult<Order>;

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()>;

    async fn get_order(&self, order_id: &str) -> BrokerResult<Order>;

    async fn get_positions(&self) -> BrokerResult<Vec<Position>>;

    async fn get_open_orders(&self) -> BrokerResult<Vec<Order>>;

    async fn get_account(&self) -> BrokerResult<Account>;

    /// Most recent `limit` bars, oldest first
    async fn get_historical_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> BrokerResult<Vec<Bar>>;

    async fn get_latest_quote(&self, symbol: &str) -> BrokerResult<Quote>;
}

/// Bound a broker call by `duration`
pub async fn with_timeout<T, F>(duration: Duration, call: F) -> BrokerResult<T>
where
    F: Future<Output = BrokerResult<T>>,
{
    match tokio::time::timeout(duration, call).await {
        Ok(result) => result,
        Err(_) => Err(BrokerError::Timeout(duration)),
    }
}
