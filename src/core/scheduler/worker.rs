//! Worker loop

use super::{Control, SchedulerSettings, WorkSource};
use crate::core::export::ProcessOutcome;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Sleep between checks while paused
pub const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Runs one worker until shutdown, returns the number of KVNRs processed
///
/// Shutdown is observed between KVNRs and during sleeps only, so a pass that
/// already started always completes.
pub(super) async fn run_worker(
    id: usize,
    source: Arc<dyn WorkSource>,
    control: Arc<Control>,
    settings: SchedulerSettings,
) -> u64 {
    let mut shutdown = control.subscribe();
    let mut processed = 0u64;
    tracing::debug!(worker = id, "Worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        if control.is_paused() {
            if sleep_or_shutdown(PAUSE_POLL, &mut shutdown).await {
                break;
            }
            continue;
        }

        let throttle = control.throttle();
        if !throttle.is_zero() && sleep_or_shutdown(throttle, &mut shutdown).await {
            break;
        }

        let delay = match source.process_next(id).await {
            ProcessOutcome::Immediate => {
                processed += 1;
                None
            }
            ProcessOutcome::NoWork => Some(settings.poll_interval),
            ProcessOutcome::TemporaryError => Some(settings.error_delay),
        };
        if let Some(delay) = delay {
            if sleep_or_shutdown(delay, &mut shutdown).await {
                break;
            }
        }
    }

    tracing::debug!(worker = id, processed, "Worker stopped");
    processed
}

/// Sleeps for `delay`, returns true when shutdown was requested
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
