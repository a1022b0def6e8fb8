//! Per-message job processing shared by the recovery sweep and the main loop.
//!
//! Every call ends in exactly one result-store write: a `completed` outcome
//! when the transformed image was written, a `failed` outcome otherwise.

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::models::job::{
    JobParseError, JobRecord, JobStatus, Operation, OperationError, OperationKind, OutcomeRecord,
    UNKNOWN_JOB_ID,
};
use crate::services::queue::{StreamEntry, JOB_DATA_FIELD};
use crate::services::results::{ResultStore, ResultStoreError};
use crate::services::transform::{self, TransformError};

/// Turns raw job payloads into transformed images and stored outcomes.
pub struct JobProcessor {
    results: Arc<dyn ResultStore>,
    results_dir: PathBuf,
    url_prefix: String,
}

impl JobProcessor {
    pub fn new(results: Arc<dyn ResultStore>, results_dir: PathBuf, url_prefix: String) -> Self {
        Self {
            results,
            results_dir,
            url_prefix: url_prefix.trim_end_matches('/').to_string(),
        }
    }

    /// Process a stream entry. An entry without a job payload is recorded as
    /// a failed job with the unknown id.
    pub async fn process_entry(&self, entry: &StreamEntry) -> Result<bool, ResultStoreError> {
        match entry.job_data.as_deref() {
            Some(payload) => self.process(payload).await,
            None => {
                let error = format!("Stream entry {} has no {JOB_DATA_FIELD} field", entry.id);
                warn!(message_id = %entry.id, "{error}");
                self.record(OutcomeRecord::failed(UNKNOWN_JOB_ID, error)).await?;
                metrics::counter!("image_jobs_failed_total").increment(1);
                Ok(false)
            }
        }
    }

    /// Process one serialized job record.
    ///
    /// Returns `Ok(true)` when the job completed and `Ok(false)` when it
    /// failed and the failure was recorded. `Err` means the outcome itself
    /// could not be stored.
    pub async fn process(&self, payload: &str) -> Result<bool, ResultStoreError> {
        let started = Instant::now();

        let job = match JobRecord::parse(payload) {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %e.job_id, error = %e, "Rejected malformed job payload");
                let job_id = e.job_id.clone();
                self.record(OutcomeRecord::failed(&job_id, ProcessError::from(e).to_string()))
                    .await?;
                metrics::counter!("image_jobs_failed_total").increment(1);
                return Ok(false);
            }
        };

        info!(
            job_id = %job.job_id,
            operation = %job.operation,
            file_path = %job.file_path,
            original_filename = job.original_filename.as_deref().unwrap_or(""),
            "Processing image job"
        );

        let outcome = match self.execute(&job).await {
            Ok((kind, url)) => {
                info!(
                    job_id = %job.job_id,
                    operation = %kind,
                    processed_image_url = %url,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Job completed"
                );
                OutcomeRecord::completed(&job.job_id, kind, url)
            }
            Err(e) => {
                warn!(job_id = %job.job_id, operation = %job.operation, error = %e, "Job failed");
                OutcomeRecord::failed(&job.job_id, e.to_string())
            }
        };

        let status = outcome.status();
        self.record(outcome).await?;

        metrics::histogram!("image_job_processing_seconds").record(started.elapsed().as_secs_f64());
        match status {
            JobStatus::Completed => {
                metrics::counter!("image_jobs_completed_total", "operation" => job.operation.clone())
                    .increment(1);
                Ok(true)
            }
            JobStatus::Failed => {
                metrics::counter!("image_jobs_failed_total").increment(1);
                Ok(false)
            }
        }
    }

    /// Resolve, transform and save. Returns the public URL of the output.
    async fn execute(&self, job: &JobRecord) -> Result<(OperationKind, String), ProcessError> {
        let operation = Operation::from_job(job)?;
        let kind = operation.kind();

        let output_name = output_file_name(Path::new(&job.file_path), kind, &Local::now());
        let output_path = self.results_dir.join(&output_name);

        transform::transform_file_async(PathBuf::from(&job.file_path), output_path, operation).await?;

        Ok((kind, format!("{}/{}", self.url_prefix, output_name)))
    }

    async fn record(&self, outcome: OutcomeRecord) -> Result<(), ResultStoreError> {
        self.results.put(&outcome).await.inspect_err(|e| {
            tracing::error!(job_id = %outcome.job_id(), error = %e, "Failed to store job outcome");
        })
    }
}

/// `{stem}_{operation}_{YYYYmmddHHMMSS}{.ext}` for a source file.
pub fn output_file_name(source: &Path, operation: OperationKind, at: &DateTime<Local>) -> String {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = source
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    format!("{stem}_{operation}_{}{ext}", at.format("%Y%m%d%H%M%S"))
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Parse(#[from] JobParseError),

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error(transparent)]
    Transform(#[from] TransformError),
}
