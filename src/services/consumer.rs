//! Consumer group bootstrap and the steady-state consume loop.

use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, trace};

use crate::context::WorkerContext;
use crate::services::queue::{GroupStatus, JobStream, QueueError, StreamEntry};
use crate::services::results::ResultStoreError;

/// Ensure the consumer group exists. Safe to call repeatedly.
pub async fn bootstrap(stream: &dyn JobStream) -> Result<GroupStatus, QueueError> {
    let status = stream.ensure_group().await?;
    match status {
        GroupStatus::Created => info!("Created consumer group"),
        GroupStatus::AlreadyExists => info!("Consumer group already exists"),
    }
    Ok(status)
}

/// Counters for one run of the consume loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub received: u64,
    pub completed: u64,
    pub failed: u64,
    pub errors: u64,
}

/// Read, process and acknowledge new entries until `shutdown` turns true.
///
/// The flag is checked between reads, so shutdown takes effect within one
/// block timeout and never interrupts a message being processed.
pub async fn run(ctx: &WorkerContext, mut shutdown: watch::Receiver<bool>) -> LoopStats {
    info!(
        block_timeout_ms = ctx.settings.block_timeout.as_millis() as u64,
        "Worker ready, starting consume loop"
    );

    let mut stats = LoopStats::default();

    loop {
        let stopping = *shutdown.borrow();
        if stopping {
            break;
        }

        if let Err(e) = poll_once(ctx, &mut stats).await {
            stats.errors += 1;
            metrics::counter!("image_worker_loop_errors_total").increment(1);
            error!(error = %e, "Error in consume loop, backing off");

            if sleep_or_shutdown(ctx.settings.error_backoff, &mut shutdown).await {
                break;
            }
        }
    }

    info!(
        received = stats.received,
        completed = stats.completed,
        failed = stats.failed,
        errors = stats.errors,
        "Shutting down consume loop"
    );
    stats
}

async fn poll_once(ctx: &WorkerContext, stats: &mut LoopStats) -> Result<(), LoopError> {
    let entries = ctx
        .stream
        .read_new(ctx.settings.read_count, ctx.settings.block_timeout)
        .await?;

    if entries.is_empty() {
        trace!("No new entries");
        return Ok(());
    }

    for entry in &entries {
        stats.received += 1;
        if handle_entry(ctx, entry).await? {
            stats.completed += 1;
        } else {
            stats.failed += 1;
        }
    }

    Ok(())
}

/// Process one entry and acknowledge it.
///
/// Failed jobs are acknowledged too: their outcome is recorded and they are
/// not retried. An entry is left pending only when its outcome could not be
/// stored or the acknowledgement itself failed.
pub(crate) async fn handle_entry(ctx: &WorkerContext, entry: &StreamEntry) -> Result<bool, LoopError> {
    debug!(message_id = %entry.id, "Received stream entry");
    metrics::counter!("image_jobs_received_total").increment(1);

    let succeeded = ctx.processor.process_entry(entry).await?;
    ctx.stream.ack(&entry.id).await?;

    debug!(message_id = %entry.id, succeeded, "Acknowledged stream entry");
    Ok(succeeded)
}

/// Sleep for `duration` unless shutdown is requested first. Returns true on shutdown.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    ResultStore(#[from] ResultStoreError),
}
