//! Event store abstraction traits
//!
//! [`ExportStore`] is the persistence contract of the export pipeline. Its
//! claim operation is the cross-process coordination point: an implementation
//! must hand a KVNR to at most one caller at a time. [`AuditSink`] receives one
//! record per delivery attempt.

use crate::domain::{
    AuditRecord, EventKvnr, HashedKvnr, PrescriptionId, PrescriptionType, Result, TaskEvent,
};
use async_trait::async_trait;
use std::time::Duration;

/// How long a claimed KVNR stays invisible to other workers
pub const PROCESSING_LEASE: Duration = Duration::from_secs(5 * 60);

/// Event store used by the scheduler and the KVNR processor
#[async_trait]
pub trait ExportStore: Send + Sync {
    /// Claims the next due KVNR
    ///
    /// Picks one row with `next_export < now` and state `pending` or
    /// `processing` (an expired lease), ordered by `next_export`, skipping
    /// rows locked by other callers. The row is flipped to `processing` and
    /// its `next_export` pushed out by [`PROCESSING_LEASE`].
    ///
    /// Returns `None` when nothing is due.
    async fn claim_next_kvnr(&self) -> Result<Option<EventKvnr>>;

    /// Pending events for a KVNR ordered by `(prescription_id, last_modified)`
    async fn pending_events(&self, kvnr: &HashedKvnr) -> Result<Vec<TaskEvent>>;

    /// True when any event of the prescription is already dead-lettered
    async fn is_dead_letter(
        &self,
        kvnr: &HashedKvnr,
        prescription_id: &PrescriptionId,
        prescription_type: PrescriptionType,
    ) -> Result<bool>;

    /// Dead-letters every event of the prescription, returns the number of rows changed
    async fn mark_dead_letter(
        &self,
        kvnr: &HashedKvnr,
        prescription_id: &PrescriptionId,
        prescription_type: PrescriptionType,
    ) -> Result<u64>;

    /// Dead-letters the first pending event of the KVNR and returns it
    async fn mark_first_event_dead_letter(&self, kvnr: &HashedKvnr) -> Result<Option<TaskEvent>>;

    /// Deletes one event after a confirmed export
    async fn delete_event(&self, kvnr: &HashedKvnr, event_id: i64) -> Result<()>;

    /// Deletes every event of the KVNR regardless of state
    async fn delete_all_events(&self, kvnr: &HashedKvnr) -> Result<u64>;

    /// Puts the KVNR back to `pending` with the given retry count and delay
    async fn update_processing_delay(
        &self,
        kvnr: &HashedKvnr,
        retry_count: i32,
        delay: Duration,
    ) -> Result<()>;

    /// Moves a `processing` KVNR to `processed` and resets its retry count
    async fn finalize_kvnr(&self, kvnr: &HashedKvnr) -> Result<()>;

    /// Records the result of an account lookup
    async fn record_consent_check(&self, kvnr: &HashedKvnr, assigned_epa: &str) -> Result<()>;

    /// Checks the store is reachable
    async fn health_check(&self) -> Result<()>;
}

/// Receiver of audit records
///
/// Failures are reported to the caller, which logs and drops them.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Appends one record
    async fn append(&self, record: AuditRecord) -> Result<()>;
}

/// Audit sink that writes records to the `audit` tracing target
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn append(&self, record: AuditRecord) -> Result<()> {
        let json = serde_json::to_string(&record)?;
        tracing::info!(target: "audit", record = %json, "Audit record");
        Ok(())
    }
}
