use std::sync::Arc;
use tracing::info;

use crate::config::{AppConfig, ConsumerSettings};
use crate::services::{
    consumer,
    processor::JobProcessor,
    queue::{JobStream, QueueError, RedisJobStream},
    results::RedisResultStore,
};

/// Everything the recovery sweep and consume loop need, built once at startup
/// and passed explicitly.
#[derive(Clone)]
pub struct WorkerContext {
    pub stream: Arc<dyn JobStream>,
    pub processor: Arc<JobProcessor>,
    pub settings: ConsumerSettings,
}

impl WorkerContext {
    pub fn new(stream: Arc<dyn JobStream>, processor: Arc<JobProcessor>, settings: ConsumerSettings) -> Self {
        Self {
            stream,
            processor,
            settings,
        }
    }

    /// Connect to Redis, create the results directory and bootstrap the
    /// consumer group.
    pub async fn initialize(config: &AppConfig) -> Result<Self, StartupError> {
        info!(redis_url = %config.redis_url(), "Connecting to Redis");
        let client = redis::Client::open(config.redis_url()).map_err(QueueError::Redis)?;

        let stream = RedisJobStream::new(
            client.clone(),
            &config.stream_key,
            &config.consumer_group,
            &config.consumer_name,
        );
        stream.health_check().await?;

        tokio::fs::create_dir_all(&config.results_dir)
            .await
            .map_err(|source| StartupError::ResultsDir {
                path: config.results_dir.display().to_string(),
                source,
            })?;
        info!(results_dir = %config.results_dir.display(), "Results directory ready");

        let processor = JobProcessor::new(
            Arc::new(RedisResultStore::new(client)),
            config.results_dir.clone(),
            config.results_url_prefix(),
        );

        let ctx = Self::new(Arc::new(stream), Arc::new(processor), config.consumer_settings());
        consumer::bootstrap(ctx.stream.as_ref()).await?;

        Ok(ctx)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] envy::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Failed to create results directory {path}: {source}")]
    ResultsDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
