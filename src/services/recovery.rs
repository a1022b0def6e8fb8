//! Startup sweep over the consumer group's pending-entries list.
//!
//! Entries delivered to some consumer of the group (possibly a crashed one)
//! but never acknowledged are claimed once they have been idle long enough,
//! then processed and acknowledged like freshly read entries.

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::context::WorkerContext;
use crate::services::consumer::{handle_entry, LoopError};

/// What one recovery sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Pending entries in the group when the sweep started.
    pub pending: usize,
    /// Entries this consumer took ownership of.
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    /// Entries left alone because another consumer touched them recently.
    pub skipped: usize,
    /// Whether the sweep stopped early on an error.
    pub aborted: bool,
}

/// Drain recoverable pending entries. Errors are logged and end the sweep
/// early; they are never returned, so startup always continues.
pub async fn recover_pending(ctx: &WorkerContext, shutdown: &watch::Receiver<bool>) -> RecoveryReport {
    let mut report = RecoveryReport::default();

    if let Err(e) = sweep(ctx, shutdown, &mut report).await {
        report.aborted = true;
        error!(error = %e, "Error processing pending jobs, continuing startup");
    }

    if report.pending > 0 {
        info!(
            pending = report.pending,
            claimed = report.claimed,
            completed = report.completed,
            failed = report.failed,
            skipped = report.skipped,
            "Recovery sweep finished"
        );
    }
    report
}

async fn sweep(
    ctx: &WorkerContext,
    shutdown: &watch::Receiver<bool>,
    report: &mut RecoveryReport,
) -> Result<(), LoopError> {
    report.pending = ctx.stream.pending_count().await?;
    if report.pending == 0 {
        debug!("No pending jobs to recover");
        return Ok(());
    }
    info!(pending = report.pending, "Found pending jobs");

    let min_idle = ctx.settings.claim_min_idle;
    let pending = ctx.stream.pending_entries(ctx.settings.recovery_batch_size).await?;

    for candidate in pending {
        let stopping = *shutdown.borrow();
        if stopping {
            warn!("Shutdown requested during recovery sweep");
            break;
        }

        if candidate.idle < min_idle {
            debug!(
                message_id = %candidate.id,
                consumer = %candidate.consumer,
                idle_ms = candidate.idle.as_millis() as u64,
                "Pending entry still active, leaving it"
            );
            report.skipped += 1;
            continue;
        }

        let claimed = ctx
            .stream
            .claim(std::slice::from_ref(&candidate.id), min_idle)
            .await?;
        if claimed.is_empty() {
            report.skipped += 1;
            continue;
        }

        for entry in &claimed {
            report.claimed += 1;
            metrics::counter!("image_jobs_recovered_total").increment(1);
            info!(
                message_id = %entry.id,
                previous_consumer = %candidate.consumer,
                delivery_count = candidate.delivery_count,
                "Processing pending job"
            );

            if handle_entry(ctx, entry).await? {
                report.completed += 1;
            } else {
                report.failed += 1;
            }
        }
    }

    Ok(())
}
