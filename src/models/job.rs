use garde::Validate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString};

/// Job id recorded when a payload is too malformed to yield one.
pub const UNKNOWN_JOB_ID: &str = "unknown";

pub const DEFAULT_WIDTH: u32 = 800;
pub const DEFAULT_HEIGHT: u32 = 600;
pub const DEFAULT_BLUR_RADIUS: u32 = 2;
pub const MAX_DIMENSION: u32 = 10_000;
pub const MAX_BLUR_RADIUS: u32 = 100;

/// An image-processing job as appended to the stream by the producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: String,
    pub file_path: String,
    pub operation: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_filename: Option<String>,
}

impl JobRecord {
    /// Parse a `jobData` payload.
    ///
    /// On failure the error carries the best job id that could be recovered
    /// from the payload, or [`UNKNOWN_JOB_ID`].
    pub fn parse(payload: &str) -> Result<Self, JobParseError> {
        serde_json::from_str(payload).map_err(|source| JobParseError {
            job_id: salvage_job_id(payload),
            source,
        })
    }
}

fn salvage_job_id(payload: &str) -> String {
    serde_json::from_str::<Value>(payload)
        .ok()
        .and_then(|v| v.get("jobId").and_then(Value::as_str).map(str::to_owned))
        .unwrap_or_else(|| UNKNOWN_JOB_ID.to_string())
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid job payload: {source}")]
pub struct JobParseError {
    pub job_id: String,
    #[source]
    pub source: serde_json::Error,
}

/// The operations this worker knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum OperationKind {
    Resize,
    Grayscale,
    Blur,
}

#[derive(Debug, Clone, PartialEq, Eq, Validate)]
pub struct ResizeParams {
    #[garde(range(min = 1, max = MAX_DIMENSION))]
    pub width: u32,
    #[garde(range(min = 1, max = MAX_DIMENSION))]
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Validate)]
pub struct BlurParams {
    #[garde(range(max = MAX_BLUR_RADIUS))]
    pub radius: u32,
}

/// A fully resolved operation with typed parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Resize(ResizeParams),
    Grayscale,
    Blur(BlurParams),
}

impl Operation {
    /// Resolve the operation named by a job, applying parameter defaults.
    pub fn from_job(job: &JobRecord) -> Result<Self, OperationError> {
        let kind: OperationKind = job
            .operation
            .parse()
            .map_err(|_| OperationError::Unsupported(job.operation.clone()))?;

        let operation = match kind {
            OperationKind::Resize => {
                let params = ResizeParams {
                    width: param_u32(&job.params, "width", DEFAULT_WIDTH)?,
                    height: param_u32(&job.params, "height", DEFAULT_HEIGHT)?,
                };
                params
                    .validate()
                    .map_err(|report| OperationError::InvalidParameter(report.to_string()))?;
                Operation::Resize(params)
            }
            OperationKind::Grayscale => Operation::Grayscale,
            OperationKind::Blur => {
                let params = BlurParams {
                    radius: param_u32(&job.params, "radius", DEFAULT_BLUR_RADIUS)?,
                };
                params
                    .validate()
                    .map_err(|report| OperationError::InvalidParameter(report.to_string()))?;
                Operation::Blur(params)
            }
        };

        Ok(operation)
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Resize(_) => OperationKind::Resize,
            Operation::Grayscale => OperationKind::Grayscale,
            Operation::Blur(_) => OperationKind::Blur,
        }
    }
}

/// Read an integer parameter. Producers submitting form data send numbers
/// as strings, so decimal strings are accepted alongside JSON numbers.
fn param_u32(params: &Map<String, Value>, name: &str, default: u32) -> Result<u32, OperationError> {
    let invalid = |value: &Value| {
        OperationError::InvalidParameter(format!("{name}: expected a non-negative integer, got {value}"))
    };

    match params.get(name) {
        None | Some(Value::Null) => Ok(default),
        // Fractions are rejected, never truncated.
        Some(value @ Value::Number(n)) => {
            let int = n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
                .ok_or_else(|| invalid(value))?;
            u32::try_from(int).map_err(|_| invalid(value))
        }
        Some(value @ Value::String(s)) => s.trim().parse::<u32>().map_err(|_| invalid(value)),
        Some(other) => Err(invalid(other)),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Invalid parameter {0}")]
    InvalidParameter(String),
}

/// Status of a processed job as seen by whoever polls the result store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Failed,
}

/// Persisted result of one processing attempt, keyed by job id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeRecord {
    #[serde(rename_all = "camelCase")]
    Completed {
        job_id: String,
        operation: String,
        processed_image_url: String,
        completed_at: f64,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        job_id: String,
        error: String,
        completed_at: f64,
    },
}

impl OutcomeRecord {
    pub fn completed(job_id: &str, operation: OperationKind, processed_image_url: String) -> Self {
        OutcomeRecord::Completed {
            job_id: job_id.to_string(),
            operation: operation.to_string(),
            processed_image_url,
            completed_at: unix_seconds_now(),
        }
    }

    pub fn failed(job_id: &str, error: impl Into<String>) -> Self {
        OutcomeRecord::Failed {
            job_id: job_id.to_string(),
            error: error.into(),
            completed_at: unix_seconds_now(),
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            OutcomeRecord::Completed { job_id, .. } | OutcomeRecord::Failed { job_id, .. } => job_id,
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            OutcomeRecord::Completed { .. } => JobStatus::Completed,
            OutcomeRecord::Failed { .. } => JobStatus::Failed,
        }
    }
}

fn unix_seconds_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
