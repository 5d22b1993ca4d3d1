//! Worker scheduling
//!
//! A fixed number of workers each loop over claim-and-process. The
//! [`SchedulerHandle`] pauses, throttles and stops them without restarting:
//!
//! ```rust,no_run
//! use medication_exporter::core::scheduler::{Scheduler, SchedulerSettings, WorkSource};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example(source: Arc<dyn WorkSource>) {
//! let scheduler = Scheduler::start(source, SchedulerSettings {
//!     worker_count: 4,
//!     poll_interval: Duration::from_secs(5),
//!     error_delay: Duration::from_secs(60),
//! });
//! let handle = scheduler.handle();
//! handle.set_throttle(Duration::from_millis(250));
//! handle.shutdown();
//! scheduler.join().await;
//! # }
//! ```

pub mod worker;

use crate::config::ExportConfig;
use crate::core::export::ProcessOutcome;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

pub use worker::PAUSE_POLL;

/// Unit of work a worker repeats
#[async_trait]
pub trait WorkSource: Send + Sync {
    async fn process_next(&self, worker: usize) -> ProcessOutcome;
}

/// Worker count and sleep intervals
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub worker_count: usize,
    /// Sleep after finding nothing due
    pub poll_interval: Duration,
    /// Sleep after a store error
    pub error_delay: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &ExportConfig) -> Self {
        Self {
            worker_count: config.worker_count,
            poll_interval: config.poll_interval(),
            error_delay: config.error_delay(),
        }
    }
}

/// State shared by the workers and every handle
pub(crate) struct Control {
    paused: AtomicBool,
    throttle_ms: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl Control {
    fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            paused: AtomicBool::new(false),
            throttle_ms: AtomicU64::new(0),
            shutdown,
        }
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms.load(Ordering::SeqCst))
    }
}

/// Control surface of a running scheduler
#[derive(Clone)]
pub struct SchedulerHandle {
    control: Arc<Control>,
}

impl SchedulerHandle {
    /// Stops claiming new KVNRs; passes in flight complete
    pub fn pause(&self) {
        if !self.control.paused.swap(true, Ordering::SeqCst) {
            tracing::info!("Scheduler paused");
        }
    }

    pub fn resume(&self) {
        if self.control.paused.swap(false, Ordering::SeqCst) {
            tracing::info!("Scheduler resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    /// Extra delay before every claim, zero disables
    pub fn set_throttle(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.control.throttle_ms.store(millis, Ordering::SeqCst);
        tracing::info!(throttle_ms = millis, "Scheduler throttle set");
    }

    pub fn throttle(&self) -> Duration {
        self.control.throttle()
    }

    /// Asks every worker to stop after its current pass
    pub fn shutdown(&self) {
        if !self.control.shutdown.send_replace(true) {
            tracing::info!("Scheduler shutdown requested");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.control.shutdown.borrow()
    }
}

/// Running workers
pub struct Scheduler {
    workers: JoinSet<u64>,
    handle: SchedulerHandle,
}

impl Scheduler {
    /// Spawns `worker_count` workers over `source`
    pub fn start(source: Arc<dyn WorkSource>, settings: SchedulerSettings) -> Self {
        let control = Arc::new(Control::new());
        let mut workers = JoinSet::new();
        for id in 0..settings.worker_count {
            workers.spawn(worker::run_worker(
                id,
                source.clone(),
                control.clone(),
                settings.clone(),
            ));
        }
        tracing::info!(
            workers = settings.worker_count,
            poll_interval_secs = settings.poll_interval.as_secs(),
            "Scheduler started"
        );

        Self {
            workers,
            handle: SchedulerHandle { control },
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Waits for every worker to exit, returns the KVNRs they processed
    pub async fn join(mut self) -> u64 {
        let mut processed = 0;
        while let Some(result) = self.workers.join_next().await {
            match result {
                Ok(count) => processed += count,
                Err(e) => tracing::error!(error = %e, "Worker task failed"),
            }
        }
        tracing::info!(processed, "Scheduler stopped");
        processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Counts calls; every call takes `work` and reports `outcome`
    struct CountingSource {
        started: AtomicUsize,
        completed: AtomicUsize,
        work: Duration,
        outcome: ProcessOutcome,
    }

    impl CountingSource {
        fn new(work: Duration, outcome: ProcessOutcome) -> Arc<Self> {
            Arc::new(Self {
                started: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
                work,
                outcome,
            })
        }

        fn started(&self) -> usize {
            self.started.load(Ordering::SeqCst)
        }

        fn completed(&self) -> usize {
            self.completed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WorkSource for CountingSource {
        async fn process_next(&self, _worker: usize) -> ProcessOutcome {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            self.outcome
        }
    }

    fn settings(worker_count: usize) -> SchedulerSettings {
        SchedulerSettings {
            worker_count,
            poll_interval: Duration::from_secs(3600),
            error_delay: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight_work() {
        let source = CountingSource::new(Duration::from_millis(50), ProcessOutcome::Immediate);
        let scheduler = Scheduler::start(source.clone(), settings(3));
        tokio::time::sleep(Duration::from_millis(20)).await;

        scheduler.handle().shutdown();
        let processed = scheduler.join().await;

        assert!(source.started() >= 3);
        assert_eq!(source.started(), source.completed());
        assert_eq!(processed as usize, source.completed());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_poll_sleep() {
        let source = CountingSource::new(Duration::ZERO, ProcessOutcome::NoWork);
        let scheduler = Scheduler::start(source.clone(), settings(2));
        tokio::time::sleep(Duration::from_millis(20)).await;

        scheduler.handle().shutdown();
        let joined = tokio::time::timeout(Duration::from_secs(1), scheduler.join()).await;

        assert_eq!(joined.unwrap(), 0);
        assert_eq!(source.started(), 2);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let source = CountingSource::new(Duration::from_millis(1), ProcessOutcome::Immediate);
        let scheduler = Scheduler::start(source.clone(), settings(1));
        let handle = scheduler.handle();

        handle.pause();
        assert!(handle.is_paused());
        // Let a pass that started before the pause finish
        tokio::time::sleep(Duration::from_millis(20)).await;
        let paused_at = source.started();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(source.started(), paused_at);

        handle.resume();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(source.started() > paused_at);

        handle.shutdown();
        scheduler.join().await;
    }

    #[tokio::test]
    async fn test_throttle_limits_rate() {
        let source = CountingSource::new(Duration::ZERO, ProcessOutcome::Immediate);
        let scheduler = Scheduler::start(source.clone(), settings(1));
        let handle = scheduler.handle();
        handle.set_throttle(Duration::from_millis(100));
        assert_eq!(handle.throttle(), Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let before = source.started();
        tokio::time::sleep(Duration::from_millis(350)).await;
        let calls = source.started() - before;
        assert!(calls <= 5, "{calls} calls under a 100ms throttle");

        handle.shutdown();
        assert!(handle.is_shutdown());
        scheduler.join().await;
    }
}
