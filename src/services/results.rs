use async_trait::async_trait;
use redis::AsyncCommands;

use crate::models::job::OutcomeRecord;

const RESULT_KEY_PREFIX: &str = "job-result:";

/// Key under which the outcome of `job_id` is stored.
pub fn result_key(job_id: &str) -> String {
    format!("{RESULT_KEY_PREFIX}{job_id}")
}

/// Write side of the externally visible job-result store.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Store an outcome, replacing any earlier outcome for the same job.
    async fn put(&self, outcome: &OutcomeRecord) -> Result<(), ResultStoreError>;
}

/// Stores outcomes as JSON strings in Redis.
pub struct RedisResultStore {
    client: redis::Client,
}

impl RedisResultStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResultStore for RedisResultStore {
    async fn put(&self, outcome: &OutcomeRecord) -> Result<(), ResultStoreError> {
        let payload = serde_json::to_string(outcome).map_err(ResultStoreError::Serialize)?;
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(ResultStoreError::Redis)?;
        conn.set::<_, _, ()>(result_key(outcome.job_id()), payload)
            .await
            .map_err(ResultStoreError::Redis)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResultStoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
