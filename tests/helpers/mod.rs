//! In-memory stand-ins for the job stream and result store

#![allow(dead_code)]

use async_trait::async_trait;
use image::{DynamicImage, Rgb, RgbImage, Rgba, RgbaImage};
use image_stream_worker::config::ConsumerSettings;
use image_stream_worker::context::WorkerContext;
use image_stream_worker::models::job::OutcomeRecord;
use image_stream_worker::services::processor::JobProcessor;
use image_stream_worker::services::queue::{
    GroupStatus, JobStream, PendingEntry, QueueError, StreamEntry,
};
use image_stream_worker::services::results::{ResultStore, ResultStoreError};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Delivery {
    consumer: String,
    delivered_at: Instant,
    count: usize,
}

#[derive(Default)]
struct StreamState {
    group_exists: bool,
    group_create_calls: usize,
    entries: BTreeMap<u64, Option<String>>,
    next_seq: u64,
    /// Highest sequence delivered to the group
    last_delivered: u64,
    pending: BTreeMap<u64, Delivery>,
    acked: Vec<String>,
    failing_reads: usize,
    failing_acks: usize,
    broker_down: bool,
}

/// Consumer-group semantics of a Redis stream, kept in memory.
pub struct MemoryStream {
    consumer: String,
    state: Mutex<StreamState>,
}

fn entry_id(seq: u64) -> String {
    format!("{seq}-0")
}

fn parse_id(id: &str) -> Option<u64> {
    id.split('-').next()?.parse().ok()
}

impl MemoryStream {
    pub fn new(consumer: &str) -> Self {
        Self {
            consumer: consumer.to_string(),
            state: Mutex::new(StreamState::default()),
        }
    }

    /// Append an entry as the producer would. `None` omits the `jobData` field.
    pub fn append(&self, job_data: Option<&str>) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_seq += 1;
        let seq = state.next_seq;
        state.entries.insert(seq, job_data.map(str::to_owned));
        entry_id(seq)
    }

    /// Deliver every undelivered entry to another consumer, as if it read
    /// them `idle` ago and never acknowledged them.
    pub fn deliver_to(&self, consumer: &str, idle: Duration) -> Vec<String> {
        let mut state = self.state.lock().unwrap();
        let delivered_at = Instant::now().checked_sub(idle).unwrap_or_else(Instant::now);
        let seqs: Vec<u64> = state
            .entries
            .range(state.last_delivered + 1..)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &seqs {
            state.pending.insert(
                *seq,
                Delivery {
                    consumer: consumer.to_string(),
                    delivered_at,
                    count: 1,
                },
            );
            state.last_delivered = *seq;
        }
        seqs.into_iter().map(entry_id).collect()
    }

    pub fn acked(&self) -> Vec<String> {
        self.state.lock().unwrap().acked.clone()
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().pending.keys().copied().map(entry_id).collect()
    }

    pub fn pending_owner(&self, id: &str) -> Option<String> {
        let seq = parse_id(id)?;
        self.state.lock().unwrap().pending.get(&seq).map(|d| d.consumer.clone())
    }

    pub fn group_create_calls(&self) -> usize {
        self.state.lock().unwrap().group_create_calls
    }

    /// Make the next `n` blocking reads fail.
    pub fn fail_reads(&self, n: usize) {
        self.state.lock().unwrap().failing_reads = n;
    }

    /// Make the next `n` acknowledgements fail.
    pub fn fail_acks(&self, n: usize) {
        self.state.lock().unwrap().failing_acks = n;
    }

    /// Make every call fail as if the broker were unreachable.
    pub fn set_broker_down(&self, down: bool) {
        self.state.lock().unwrap().broker_down = down;
    }

    fn check_up(state: &StreamState) -> Result<(), QueueError> {
        if state.broker_down {
            return Err(broker_error("connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStream for MemoryStream {
    async fn ensure_group(&self) -> Result<GroupStatus, QueueError> {
        let mut state = self.state.lock().unwrap();
        Self::check_up(&state)?;
        state.group_create_calls += 1;
        if state.group_exists {
            Ok(GroupStatus::AlreadyExists)
        } else {
            state.group_exists = true;
            Ok(GroupStatus::Created)
        }
    }

    async fn pending_count(&self) -> Result<usize, QueueError> {
        let state = self.state.lock().unwrap();
        Self::check_up(&state)?;
        Ok(state.pending.len())
    }

    async fn pending_entries(&self, count: usize) -> Result<Vec<PendingEntry>, QueueError> {
        let state = self.state.lock().unwrap();
        Self::check_up(&state)?;
        Ok(state
            .pending
            .iter()
            .take(count)
            .map(|(seq, d)| PendingEntry {
                id: entry_id(*seq),
                consumer: d.consumer.clone(),
                idle: d.delivered_at.elapsed(),
                delivery_count: d.count,
            })
            .collect())
    }

    async fn claim(&self, ids: &[String], min_idle: Duration) -> Result<Vec<StreamEntry>, QueueError> {
        let mut state = self.state.lock().unwrap();
        Self::check_up(&state)?;
        let mut claimed = Vec::new();
        for id in ids {
            let Some(seq) = parse_id(id) else { continue };
            let job_data = state.entries.get(&seq).cloned().flatten();
            let consumer = self.consumer.clone();
            if let Some(delivery) = state.pending.get_mut(&seq) {
                if delivery.delivered_at.elapsed() >= min_idle {
                    delivery.consumer = consumer;
                    delivery.delivered_at = Instant::now();
                    delivery.count += 1;
                    claimed.push(StreamEntry {
                        id: id.clone(),
                        job_data,
                    });
                }
            }
        }
        Ok(claimed)
    }

    async fn read_new(&self, count: usize, block: Duration) -> Result<Vec<StreamEntry>, QueueError> {
        let entries = {
            let mut state = self.state.lock().unwrap();
            Self::check_up(&state)?;
            if state.failing_reads > 0 {
                state.failing_reads -= 1;
                return Err(broker_error("connection reset by peer"));
            }

            let batch: Vec<(u64, Option<String>)> = state
                .entries
                .range(state.last_delivered + 1..)
                .take(count)
                .map(|(seq, data)| (*seq, data.clone()))
                .collect();
            for (seq, _) in &batch {
                state.pending.insert(
                    *seq,
                    Delivery {
                        consumer: self.consumer.clone(),
                        delivered_at: Instant::now(),
                        count: 1,
                    },
                );
                state.last_delivered = *seq;
            }
            batch
        };

        if entries.is_empty() {
            tokio::time::sleep(block).await;
        }

        Ok(entries
            .into_iter()
            .map(|(seq, job_data)| StreamEntry {
                id: entry_id(seq),
                job_data,
            })
            .collect())
    }

    async fn ack(&self, id: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        Self::check_up(&state)?;
        if state.failing_acks > 0 {
            state.failing_acks -= 1;
            return Err(broker_error("connection reset by peer"));
        }
        if let Some(seq) = parse_id(id) {
            if state.pending.remove(&seq).is_some() {
                state.acked.push(id.to_string());
            }
        }
        Ok(())
    }
}

/// Result store that keeps the latest outcome per job plus every write.
#[derive(Default)]
pub struct MemoryResultStore {
    latest: Mutex<HashMap<String, OutcomeRecord>>,
    writes: Mutex<Vec<OutcomeRecord>>,
    failing: Mutex<bool>,
}

impl MemoryResultStore {
    pub fn get(&self, job_id: &str) -> Option<OutcomeRecord> {
        self.latest.lock().unwrap().get(job_id).cloned()
    }

    pub fn writes(&self) -> Vec<OutcomeRecord> {
        self.writes.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn put(&self, outcome: &OutcomeRecord) -> Result<(), ResultStoreError> {
        if *self.failing.lock().unwrap() {
            return Err(ResultStoreError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))));
        }
        self.writes.lock().unwrap().push(outcome.clone());
        self.latest
            .lock()
            .unwrap()
            .insert(outcome.job_id().to_string(), outcome.clone());
        Ok(())
    }
}

/// A worker wired to in-memory collaborators inside a temporary directory.
pub struct TestWorker {
    pub ctx: WorkerContext,
    pub stream: Arc<MemoryStream>,
    pub results: Arc<MemoryResultStore>,
    pub dir: tempfile::TempDir,
}

impl TestWorker {
    pub fn new() -> Self {
        Self::with_settings(fast_settings())
    }

    pub fn with_settings(settings: ConsumerSettings) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let results_dir = dir.path().join("processed");
        std::fs::create_dir_all(&results_dir).unwrap();

        let stream = Arc::new(MemoryStream::new("worker-test"));
        let results = Arc::new(MemoryResultStore::default());
        let processor = JobProcessor::new(results.clone(), results_dir, "/processed".to_string());
        let ctx = WorkerContext::new(stream.clone(), Arc::new(processor), settings);

        Self {
            ctx,
            stream,
            results,
            dir,
        }
    }

    pub fn results_dir(&self) -> PathBuf {
        self.dir.path().join("processed")
    }

    pub fn output_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(self.results_dir())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        files.sort();
        files
    }

    /// Write a generated RGB image into the temp dir and return its path.
    pub fn source_image(&self, name: &str, width: u32, height: u32) -> PathBuf {
        let path = self.dir.path().join(name);
        write_image(&path, width, height);
        path
    }

    /// Write a generated RGBA image with varying transparency.
    pub fn translucent_source_image(&self, name: &str, width: u32, height: u32) -> PathBuf {
        let path = self.dir.path().join(name);
        write_rgba_image(&path, width, height);
        path
    }
}

pub fn fast_settings() -> ConsumerSettings {
    ConsumerSettings {
        block_timeout: Duration::from_millis(10),
        read_count: 1,
        claim_min_idle: Duration::from_secs(60),
        recovery_batch_size: 10,
        error_backoff: Duration::from_millis(10),
    }
}

pub fn write_image(path: &Path, width: u32, height: u32) {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    }))
    .save(path)
    .unwrap();
}

pub fn write_rgba_image(path: &Path, width: u32, height: u32) {
    DynamicImage::ImageRgba8(RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x % 256) as u8, 64, (y % 256) as u8, ((x + y) * 4 % 256) as u8])
    }))
    .save(path)
    .unwrap();
}

/// The error a dropped or refused broker connection surfaces as.
pub fn broker_error(detail: &'static str) -> QueueError {
    QueueError::Redis(redis::RedisError::from((redis::ErrorKind::IoError, "broker unreachable", detail.to_string())))
}

/// Poll `check` until it holds or five seconds pass.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
