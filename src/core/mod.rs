//! Core business logic of the exporter.
//!
//! # Modules
//!
//! - [`export`] - Event decoding, delivery and the per-KVNR state machine
//! - [`scheduler`] - Worker loops with pause, throttle and graceful shutdown
//!
//! # Export Workflow
//!
//! Each worker repeats:
//!
//! 1. **Claim**: Take the next due KVNR from the event store
//! 2. **Lookup**: Decrypt the KVNR and find the insurant's ePA account
//! 3. **Deliver**: Send the pending events in order over a TEE3 channel
//! 4. **Record**: Delete delivered events, dead-letter rejected prescriptions
//! 5. **Reschedule**: Finalize the KVNR or schedule its next pass
//!
//! # Example
//!
//! ```rust,no_run
//! use medication_exporter::core::export::KvnrProcessor;
//! use medication_exporter::core::scheduler::{Scheduler, SchedulerSettings};
//! use std::sync::Arc;
//!
//! # async fn example(processor: KvnrProcessor, settings: SchedulerSettings) {
//! let scheduler = Scheduler::start(Arc::new(processor), settings);
//! let handle = scheduler.handle();
//!
//! tokio::signal::ctrl_c().await.ok();
//! handle.shutdown();
//! let processed = scheduler.join().await;
//! println!("Processed {processed} KVNRs");
//! # }
//! ```

pub mod export;
pub mod scheduler;
