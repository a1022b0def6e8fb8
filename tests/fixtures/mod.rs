//! Job payloads as the producer writes them into the stream

#![allow(dead_code)]

use serde_json::{json, Value};
use std::path::Path;

pub fn job_payload(job_id: &str, file_path: &Path, operation: &str, params: Value) -> String {
    json!({
        "jobId": job_id,
        "filePath": file_path.to_string_lossy(),
        "originalFilename": file_path.file_name().map(|n| n.to_string_lossy().into_owned()),
        "operation": operation,
        "params": params,
        "timestamp": 1_700_000_000_000u64,
    })
    .to_string()
}

pub fn resize_payload(job_id: &str, file_path: &Path, width: u32, height: u32) -> String {
    job_payload(job_id, file_path, "resize", json!({ "width": width, "height": height }))
}

pub fn grayscale_payload(job_id: &str, file_path: &Path) -> String {
    job_payload(job_id, file_path, "grayscale", json!({}))
}

pub fn blur_payload(job_id: &str, file_path: &Path, radius: u32) -> String {
    job_payload(job_id, file_path, "blur", json!({ "radius": radius }))
}

/// Payloads no job id can be recovered from.
pub const MALFORMED_PAYLOADS: &[&str] = &[
    "",
    "not json at all",
    "[1, 2, 3]",
    r#"{"filePath": "in.png", "operation": "resize"}"#,
    r#"{"jobId": 42, "filePath": "in.png", "operation": "resize"}"#,
];
