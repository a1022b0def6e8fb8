//! Image stream worker
//!
//! Consumes image-processing jobs from a Redis stream through a consumer
//! group, applies the requested transformation and records a completion or
//! failure outcome per job id. Pending entries left behind by crashed
//! consumers are reclaimed at startup.

pub mod config;
pub mod context;
pub mod models;
pub mod services;
