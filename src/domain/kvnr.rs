//! KVNR export state
//!
//! One [`EventKvnr`] per pseudonymized patient. The row is the unit of work
//! the scheduler claims, and it carries the retry bookkeeping for all of the
//! patient's pending events.

use super::ids::HashedKvnr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a KVNR row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvnrState {
    /// Waiting for `next_export`
    Pending,
    /// Claimed by a worker
    Processing,
    /// All events handled, nothing scheduled
    Processed,
}

impl KvnrState {
    /// Returns the value stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            KvnrState::Pending => "pending",
            KvnrState::Processing => "processing",
            KvnrState::Processed => "processed",
        }
    }
}

impl fmt::Display for KvnrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KvnrState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(KvnrState::Pending),
            "processing" => Ok(KvnrState::Processing),
            "processed" => Ok(KvnrState::Processed),
            other => Err(format!("Unknown KVNR state: {other}")),
        }
    }
}

/// A claimed (or stored) KVNR row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventKvnr {
    /// Primary key
    pub hashed: HashedKvnr,

    /// Lifecycle state
    pub state: KvnrState,

    /// Consecutive failed export passes
    pub retry_count: i32,

    /// Earliest time a worker may claim the row again
    pub next_export: Option<DateTime<Utc>>,

    /// Last successful account lookup
    pub last_consent_check: Option<DateTime<Utc>>,

    /// ePA host the account was last routed to
    pub assigned_epa: Option<String>,
}

impl EventKvnr {
    /// Creates a pending row that is due immediately
    pub fn new(hashed: HashedKvnr) -> Self {
        Self {
            hashed,
            state: KvnrState::Pending,
            retry_count: 0,
            next_export: Some(Utc::now()),
            last_consent_check: None,
            assigned_epa: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [KvnrState::Pending, KvnrState::Processing, KvnrState::Processed] {
            assert_eq!(KvnrState::from_str(state.as_str()).unwrap(), state);
        }
        assert!(KvnrState::from_str("deleted").is_err());
    }

    #[test]
    fn test_new_kvnr_is_due() {
        let kvnr = EventKvnr::new(HashedKvnr::from_bytes(vec![1, 2, 3]));
        assert_eq!(kvnr.state, KvnrState::Pending);
        assert_eq!(kvnr.retry_count, 0);
        assert!(kvnr.next_export.is_some_and(|t| t <= Utc::now()));
    }
}
