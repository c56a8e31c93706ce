// Durable checkpoints of monitoring state
pub mod file;
pub mod redis_store;

use crate::models::Signal;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

pub use file::FileCheckpointStore;
pub use redis_store::RedisCheckpointStore;

/// Everything needed to resume monitoring after a restart
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub watchlist: Vec<String>,
    pub current_signals: Vec<Signal>,
    pub check_count: u64,
    pub error_count: u64,
    pub last_check: Option<DateTime<Utc>>,
    /// Symbols that must be sold at a profit before re-entry
    #[serde(default)]
    pub profit_required: BTreeSet<String>,
    /// Wash-sale registry: symbol -> sold at
    #[serde(default)]
    pub recently_sold: BTreeMap<String, DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Redis connection timeout after {0:?}")]
    Timeout(std::time::Duration),
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// `None` when nothing has been saved yet
    async fn load(&self) -> Result<Option<Checkpoint>, CheckpointError>;
}
