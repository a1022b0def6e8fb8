use async_trait::async_trait;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, RedisError};
use std::time::Duration;

/// Stream field carrying the serialized job record.
pub const JOB_DATA_FIELD: &str = "jobData";

/// A message read from (or claimed on) the job stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    /// `None` when the entry has no `jobData` field.
    pub job_data: Option<String>,
}

/// Summary of an entry in the group's pending-entries list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: usize,
}

/// Whether group bootstrap created the group or found it in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Created,
    AlreadyExists,
}

/// Consumer-side view of a durable job stream with consumer groups.
///
/// Every call operates on this worker's stream, group and consumer identity.
#[async_trait]
pub trait JobStream: Send + Sync {
    /// Create the consumer group at the stream's origin, creating the stream
    /// if needed. An existing group is not an error.
    async fn ensure_group(&self) -> Result<GroupStatus, QueueError>;

    /// Number of entries delivered to the group but not yet acknowledged.
    async fn pending_count(&self) -> Result<usize, QueueError>;

    /// Up to `count` pending entries across the whole id range, oldest first.
    async fn pending_entries(&self, count: usize) -> Result<Vec<PendingEntry>, QueueError>;

    /// Take ownership of the given entries if they have been idle for at
    /// least `min_idle`. Entries that no longer qualify are left out.
    async fn claim(&self, ids: &[String], min_idle: Duration) -> Result<Vec<StreamEntry>, QueueError>;

    /// Block for up to `block` waiting for entries never delivered to the group.
    /// A timeout yields an empty vector.
    async fn read_new(&self, count: usize, block: Duration) -> Result<Vec<StreamEntry>, QueueError>;

    /// Remove an entry from the group's pending list.
    async fn ack(&self, id: &str) -> Result<(), QueueError>;
}

/// Redis Streams implementation of [`JobStream`].
pub struct RedisJobStream {
    client: redis::Client,
    stream_key: String,
    group: String,
    consumer: String,
}

impl RedisJobStream {
    pub fn new(client: redis::Client, stream_key: &str, group: &str, consumer: &str) -> Self {
        Self {
            client,
            stream_key: stream_key.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
        }
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    /// Check Redis connectivity.
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

#[async_trait]
impl JobStream for RedisJobStream {
    async fn ensure_group(&self) -> Result<GroupStatus, QueueError> {
        let mut conn = self.connection().await?;
        let created: Result<(), RedisError> = conn
            .xgroup_create_mkstream(&self.stream_key, &self.group, "0")
            .await;

        match created {
            Ok(()) => Ok(GroupStatus::Created),
            Err(e) if is_busy_group(&e) => Ok(GroupStatus::AlreadyExists),
            Err(e) => Err(QueueError::Redis(e)),
        }
    }

    async fn pending_count(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        let reply: StreamPendingReply = conn
            .xpending(&self.stream_key, &self.group)
            .await
            .map_err(QueueError::Redis)?;
        Ok(reply.count())
    }

    async fn pending_entries(&self, count: usize) -> Result<Vec<PendingEntry>, QueueError> {
        let mut conn = self.connection().await?;
        let reply: StreamPendingCountReply = conn
            .xpending_count(&self.stream_key, &self.group, "-", "+", count)
            .await
            .map_err(QueueError::Redis)?;

        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                id: p.id,
                consumer: p.consumer,
                // XPENDING reports milliseconds since last delivery, i.e. idle time
                idle: Duration::from_millis(p.last_delivered_ms as u64),
                delivery_count: p.times_delivered,
            })
            .collect())
    }

    async fn claim(&self, ids: &[String], min_idle: Duration) -> Result<Vec<StreamEntry>, QueueError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection().await?;
        let reply: StreamClaimReply = conn
            .xclaim(
                &self.stream_key,
                &self.group,
                &self.consumer,
                min_idle.as_millis() as u64,
                ids,
            )
            .await
            .map_err(QueueError::Redis)?;

        Ok(reply.ids.iter().map(to_entry).collect())
    }

    async fn read_new(&self, count: usize, block: Duration) -> Result<Vec<StreamEntry>, QueueError> {
        let mut conn = self.connection().await?;
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(count)
            .block(block.as_millis() as usize);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream_key], &[">"], &opts)
            .await
            .map_err(QueueError::Redis)?;

        Ok(reply
            .map(|r| {
                r.keys
                    .iter()
                    .flat_map(|key| key.ids.iter().map(to_entry))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ack(&self, id: &str) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        conn.xack::<_, _, _, ()>(&self.stream_key, &self.group, &[id])
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

fn to_entry(id: &StreamId) -> StreamEntry {
    StreamEntry {
        id: id.id.clone(),
        job_data: id.get::<String>(JOB_DATA_FIELD),
    }
}

/// XGROUP CREATE replies `BUSYGROUP` when the group already exists.
pub(crate) fn is_busy_group(err: &RedisError) -> bool {
    err.code() == Some("BUSYGROUP") || err.to_string().contains("BUSYGROUP")
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
