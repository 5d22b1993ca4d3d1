//! Logging and observability
//!
//! Structured logging with:
//! - JSON-formatted file logs with rotation
//! - Console output
//! - Configurable log levels (`RUST_LOG` overrides the configured level)
//!
//! Log lines identify a patient by the hashed KVNR prefix only, never by the
//! plaintext KVNR.
//!
//! # Example
//!
//! ```no_run
//! use medication_exporter::logging::init_logging;
//! use medication_exporter::config::LoggingConfig;
//!
//! let _guard = init_logging("info", &LoggingConfig::console()).expect("Failed to initialize logging");
//! tracing::info!("Exporter started");
//! ```

pub mod structured;

pub use structured::{init_logging, LoggingGuard};

/// Log that a worker claimed a KVNR
///
/// ```no_run
/// use medication_exporter::log_kvnr_claimed;
/// use medication_exporter::domain::HashedKvnr;
///
/// let hashed = HashedKvnr::from_bytes(vec![0xab; 32]);
/// log_kvnr_claimed!(3, &hashed, 0);
/// ```
#[macro_export]
macro_rules! log_kvnr_claimed {
    ($worker:expr, $hashed_kvnr:expr, $retry_count:expr) => {
        tracing::debug!(
            worker = $worker,
            kvnr = %$hashed_kvnr,
            retry_count = $retry_count,
            "Claimed KVNR"
        );
    };
}

/// Log the outcome of one event delivery
#[macro_export]
macro_rules! log_dispatch_outcome {
    ($use_case:expr, $prescription_id:expr, $outcome:expr, $status:expr) => {
        tracing::info!(
            use_case = %$use_case,
            prescription_id = %$prescription_id,
            outcome = %$outcome,
            http_status = ?$status,
            "Event dispatched"
        );
    };
}

/// Log a retry attempt
#[macro_export]
macro_rules! log_retry_attempt {
    ($attempt:expr, $max_attempts:expr, $reason:expr) => {
        tracing::warn!(
            attempt = $attempt,
            max_attempts = $max_attempts,
            reason = %$reason,
            "Retrying operation"
        );
    };
}
