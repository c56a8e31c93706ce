use super::{Checkpoint, CheckpointError, CheckpointStore};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::time::{timeout, Duration};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Checkpoint stored as one JSON string under a Redis key
pub struct RedisCheckpointStore {
    conn: ConnectionManager,
    key: String,
}

impl RedisCheckpointStore {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `key` - Key holding the checkpoint
    pub async fn new(redis_url: &str, key: &str) -> Result<Self, CheckpointError> {
        let client = Client::open(redis_url)?;

        let conn = timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| CheckpointError::Timeout(CONNECT_TIMEOUT))??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            key: key.to_string(),
        })
    }
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let value = serde_json::to_string(checkpoint)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(&self.key, value).await?;
        tracing::debug!("Checkpoint saved to Redis key {}", self.key);
        Ok(())
    }

    async fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(&self.key).await?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}
