//! In-memory event store
//!
//! Implements [`ExportStore`] and [`AuditSink`] over maps guarded by one
//! `tokio::sync::Mutex`. Every operation runs under that lock, which gives
//! the claim the same exclusivity the PostgreSQL `FOR UPDATE SKIP LOCKED`
//! query has across processes.
//!
//! Not durable. Used by tests and by `run --memory-store` for local
//! development against a test ePA.

use super::traits::{AuditSink, ExportStore, PROCESSING_LEASE};
use crate::domain::{
    AuditRecord, EventKvnr, EventState, HashedKvnr, KvnrState, PrescriptionId, PrescriptionType,
    Result, TaskEvent,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Default)]
struct MemoryState {
    kvnrs: HashMap<HashedKvnr, EventKvnr>,
    events: BTreeMap<i64, TaskEvent>,
    next_event_id: i64,
    audit: Vec<AuditRecord>,
}

impl MemoryState {
    fn ordered_pending(&self, kvnr: &HashedKvnr) -> Vec<&TaskEvent> {
        let mut events: Vec<&TaskEvent> = self
            .events
            .values()
            .filter(|e| &e.hashed_kvnr == kvnr && e.state == EventState::Pending)
            .collect();
        events.sort_by(|a, b| {
            (&a.prescription_id, a.last_modified, a.id)
                .cmp(&(&b.prescription_id, b.last_modified, b.id))
        });
        events
    }
}

/// Event store held in process memory
#[derive(Default)]
pub struct MemoryExportStore {
    state: Mutex<MemoryState>,
}

impl MemoryExportStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new event the way the upstream workflow does
    ///
    /// Assigns the row id, creates the KVNR row if needed and makes a
    /// processed KVNR due again.
    pub async fn insert_event(&self, mut event: TaskEvent) -> i64 {
        let mut state = self.state.lock().await;
        state.next_event_id += 1;
        event.id = state.next_event_id;
        let id = event.id;

        let kvnr = state
            .kvnrs
            .entry(event.hashed_kvnr.clone())
            .or_insert_with(|| EventKvnr::new(event.hashed_kvnr.clone()));
        if kvnr.state == KvnrState::Processed {
            kvnr.state = KvnrState::Pending;
            kvnr.next_export = Some(Utc::now());
        }

        state.events.insert(id, event);
        id
    }

    /// Overwrites a KVNR row
    pub async fn put_kvnr(&self, kvnr: EventKvnr) {
        self.state.lock().await.kvnrs.insert(kvnr.hashed.clone(), kvnr);
    }

    /// Current KVNR row
    pub async fn kvnr(&self, kvnr: &HashedKvnr) -> Option<EventKvnr> {
        self.state.lock().await.kvnrs.get(kvnr).cloned()
    }

    /// All events of a KVNR in any state, ordered by id
    pub async fn events(&self, kvnr: &HashedKvnr) -> Vec<TaskEvent> {
        self.state
            .lock()
            .await
            .events
            .values()
            .filter(|e| &e.hashed_kvnr == kvnr)
            .cloned()
            .collect()
    }

    /// Audit records appended so far
    pub async fn audit_records(&self) -> Vec<AuditRecord> {
        self.state.lock().await.audit.clone()
    }

    /// Moves a KVNR's `next_export`, used to make rescheduled rows due
    pub async fn set_next_export(&self, kvnr: &HashedKvnr, at: DateTime<Utc>) {
        if let Some(row) = self.state.lock().await.kvnrs.get_mut(kvnr) {
            row.next_export = Some(at);
        }
    }
}

/// `now + delay`, clamped to the latest representable time
fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl ExportStore for MemoryExportStore {
    async fn claim_next_kvnr(&self) -> Result<Option<EventKvnr>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let due = state
            .kvnrs
            .values_mut()
            .filter(|k| matches!(k.state, KvnrState::Pending | KvnrState::Processing))
            .filter(|k| k.next_export.is_some_and(|at| at < now))
            .min_by_key(|k| k.next_export);

        Ok(due.map(|kvnr| {
            kvnr.state = KvnrState::Processing;
            kvnr.next_export = Some(after(now, PROCESSING_LEASE));
            kvnr.clone()
        }))
    }

    async fn pending_events(&self, kvnr: &HashedKvnr) -> Result<Vec<TaskEvent>> {
        let state = self.state.lock().await;
        Ok(state.ordered_pending(kvnr).into_iter().cloned().collect())
    }

    async fn is_dead_letter(
        &self,
        kvnr: &HashedKvnr,
        prescription_id: &PrescriptionId,
        prescription_type: PrescriptionType,
    ) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state.events.values().any(|e| {
            &e.hashed_kvnr == kvnr
                && &e.prescription_id == prescription_id
                && e.prescription_type == prescription_type
                && e.state == EventState::DeadLetterQueue
        }))
    }

    async fn mark_dead_letter(
        &self,
        kvnr: &HashedKvnr,
        prescription_id: &PrescriptionId,
        prescription_type: PrescriptionType,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut changed = 0;
        for event in state.events.values_mut().filter(|e| {
            &e.hashed_kvnr == kvnr
                && &e.prescription_id == prescription_id
                && e.prescription_type == prescription_type
                && e.state != EventState::DeadLetterQueue
        }) {
            event.state = EventState::DeadLetterQueue;
            changed += 1;
        }
        Ok(changed)
    }

    async fn mark_first_event_dead_letter(&self, kvnr: &HashedKvnr) -> Result<Option<TaskEvent>> {
        let mut state = self.state.lock().await;
        let first = state.ordered_pending(kvnr).first().map(|e| e.id);
        Ok(first.and_then(|id| {
            state.events.get_mut(&id).map(|event| {
                event.state = EventState::DeadLetterQueue;
                event.clone()
            })
        }))
    }

    async fn delete_event(&self, kvnr: &HashedKvnr, event_id: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        if state
            .events
            .get(&event_id)
            .is_some_and(|e| &e.hashed_kvnr == kvnr)
        {
            state.events.remove(&event_id);
        }
        Ok(())
    }

    async fn delete_all_events(&self, kvnr: &HashedKvnr) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.events.len();
        state.events.retain(|_, e| &e.hashed_kvnr != kvnr);
        Ok((before - state.events.len()) as u64)
    }

    async fn update_processing_delay(
        &self,
        kvnr: &HashedKvnr,
        retry_count: i32,
        delay: Duration,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(row) = state.kvnrs.get_mut(kvnr) {
            row.state = KvnrState::Pending;
            row.retry_count = retry_count;
            row.next_export = Some(after(Utc::now(), delay));
        }
        Ok(())
    }

    async fn finalize_kvnr(&self, kvnr: &HashedKvnr) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(row) = state.kvnrs.get_mut(kvnr) {
            if row.state == KvnrState::Processing {
                row.state = KvnrState::Processed;
                row.retry_count = 0;
                row.next_export = None;
            }
        }
        Ok(())
    }

    async fn record_consent_check(&self, kvnr: &HashedKvnr, assigned_epa: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(row) = state.kvnrs.get_mut(kvnr) {
            row.last_consent_check = Some(Utc::now());
            row.assigned_epa = Some(assigned_epa.to_string());
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl AuditSink for MemoryExportStore {
    async fn append(&self, record: AuditRecord) -> Result<()> {
        self.state.lock().await.audit.push(record);
        Ok(())
    }
}
