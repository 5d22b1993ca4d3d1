//! Result of one KVNR pass
//!
//! Tracks what a pass did to the KVNR's events and how it left the KVNR, for
//! the closing log line and for tests.

use crate::domain::HashedKvnr;
use std::fmt;
use std::time::Duration;

/// How a pass left the KVNR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassResult {
    /// No events left, KVNR processed
    Finalized,
    /// Account denied, not found or consent revoked; every event deleted
    Purged,
    /// Retry scheduled with backoff
    Rescheduled { retry_count: i32, delay: Duration },
    /// Record relocation in progress, retry count unchanged
    Deferred { delay: Duration },
    /// Retries exhausted, the first pending event was dead-lettered
    RetriesExhausted,
    /// The KVNR of the first event could not be decrypted
    Undecodable,
}

impl fmt::Display for PassResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassResult::Finalized => f.write_str("finalized"),
            PassResult::Purged => f.write_str("purged"),
            PassResult::Rescheduled { retry_count, delay } => {
                write!(f, "rescheduled (retry {retry_count}, in {}s)", delay.as_secs())
            }
            PassResult::Deferred { delay } => write!(f, "deferred (in {}s)", delay.as_secs()),
            PassResult::RetriesExhausted => f.write_str("retries exhausted"),
            PassResult::Undecodable => f.write_str("undecodable"),
        }
    }
}

/// Summary of one KVNR pass
#[derive(Debug, Clone)]
pub struct PassSummary {
    pub kvnr: HashedKvnr,

    /// Events confirmed by the ePA and deleted
    pub delivered: usize,

    /// Events moved to the dead-letter queue, whole groups counted once
    pub dead_lettered: usize,

    /// Events skipped because their prescription is dead-lettered
    pub skipped: usize,

    /// Events deleted by a purge
    pub purged: u64,

    pub result: PassResult,

    pub duration: Duration,
}

impl PassSummary {
    pub fn new(kvnr: HashedKvnr) -> Self {
        Self {
            kvnr,
            delivered: 0,
            dead_lettered: 0,
            skipped: 0,
            purged: 0,
            result: PassResult::Finalized,
            duration: Duration::ZERO,
        }
    }

    /// Set the duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Set the result
    pub fn with_result(mut self, result: PassResult) -> Self {
        self.result = result;
        self
    }

    /// True when the KVNR needs another pass later
    pub fn is_pending(&self) -> bool {
        !matches!(self.result, PassResult::Finalized | PassResult::Purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_builders() {
        let summary = PassSummary::new(HashedKvnr::from_bytes(vec![1, 2]))
            .with_result(PassResult::Deferred {
                delay: Duration::from_secs(86_400),
            })
            .with_duration(Duration::from_millis(12));

        assert!(summary.is_pending());
        assert_eq!(summary.duration, Duration::from_millis(12));
        assert_eq!(summary.result.to_string(), "deferred (in 86400s)");
    }

    #[test]
    fn test_finished_results() {
        let summary = PassSummary::new(HashedKvnr::from_bytes(vec![1]));
        assert!(!summary.is_pending());
        assert!(!summary.with_result(PassResult::Purged).is_pending());
    }
}
