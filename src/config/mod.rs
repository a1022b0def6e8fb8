use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Redis host
    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    /// Redis port
    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    /// Stream the producer appends jobs to
    #[serde(default = "default_stream_key")]
    pub stream_key: String,

    /// Consumer group shared by all worker instances
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// This instance's identity within the group (defaults to `worker-{pid}`)
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,

    /// Directory processed images are written to
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,

    /// Upper bound on a single blocking stream read, in milliseconds
    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,

    /// Maximum entries returned by one blocking read
    #[serde(default = "default_read_count")]
    pub read_count: usize,

    /// Idle time a pending entry needs before the recovery sweep claims it
    #[serde(default = "default_claim_min_idle_ms")]
    pub claim_min_idle_ms: u64,

    /// Pending entries enumerated per recovery sweep
    #[serde(default = "default_recovery_batch_size")]
    pub recovery_batch_size: usize,

    /// Sleep after a failed loop iteration, in milliseconds
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_stream_key() -> String {
    "image-processing-jobs".to_string()
}

fn default_consumer_group() -> String {
    "image-processors".to_string()
}

fn default_consumer_name() -> String {
    format!("worker-{}", std::process::id())
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("processed")
}

fn default_block_timeout_ms() -> u64 {
    5000
}

fn default_read_count() -> usize {
    1
}

fn default_claim_min_idle_ms() -> u64 {
    60_000
}

fn default_recovery_batch_size() -> usize {
    10
}

fn default_error_backoff_ms() -> u64 {
    1000
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Connection URL for the broker.
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/", self.redis_host, self.redis_port)
    }

    /// Public prefix under which processed images are served, e.g. `/processed`.
    pub fn results_url_prefix(&self) -> String {
        url_prefix_for(&self.results_dir)
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            block_timeout: Duration::from_millis(self.block_timeout_ms),
            read_count: self.read_count.max(1),
            claim_min_idle: Duration::from_millis(self.claim_min_idle_ms),
            recovery_batch_size: self.recovery_batch_size.max(1),
            error_backoff: Duration::from_millis(self.error_backoff_ms),
        }
    }
}

/// Timing and batching knobs for the consume loop and recovery sweep.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub block_timeout: Duration,
    pub read_count: usize,
    pub claim_min_idle: Duration,
    pub recovery_batch_size: usize,
    pub error_backoff: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            block_timeout: Duration::from_millis(default_block_timeout_ms()),
            read_count: default_read_count(),
            claim_min_idle: Duration::from_millis(default_claim_min_idle_ms()),
            recovery_batch_size: default_recovery_batch_size(),
            error_backoff: Duration::from_millis(default_error_backoff_ms()),
        }
    }
}

pub(crate) fn url_prefix_for(dir: &Path) -> String {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "processed".to_string());
    format!("/{name}")
}
