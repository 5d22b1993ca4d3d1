//! Per-KVNR export state machine
//!
//! One pass over a claimed KVNR:
//!
//! 1. Load the pending events in `(prescription_id, last_modified)` order.
//!    None left finalizes the KVNR.
//! 2. Decrypt the KVNR of the first event and look up the insurant's account.
//! 3. Branch on the lookup:
//!    - `allowed`: deliver the events in order. A success deletes the event,
//!      a rejection dead-letters its prescription and moves on, a retry
//!      stops the pass and reschedules the KVNR.
//!    - `deny` / `notFound`: delete every event and finalize.
//!    - `conflict`: leave the events and come back after the conflict wait.
//!    - `unknown`: reschedule with backoff.
//!
//! A KVNR that failed more than `max_retries` passes gets its oldest pending
//! event dead-lettered so the remaining events can make progress.

use super::backoff::backoff;
use super::client::{ClientProvider, EpaTransport};
use super::decoder::EventDecoder;
use super::dispatcher::EventDispatcher;
use super::summary::{PassResult, PassSummary};
use crate::adapters::database::ExportStore;
use crate::adapters::epa::AccountLookup;
use crate::config::ExportConfig;
use crate::core::scheduler::WorkSource;
use crate::domain::{DispatchOutcome, EpaAccount, EventKvnr, HashedKvnr, LookupCode, Result, TaskEvent};
use crate::log_kvnr_claimed;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What the worker should do after one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// A KVNR was processed, claim the next one right away
    Immediate,
    /// Nothing was due
    NoWork,
    /// The store failed, back off before claiming again
    TemporaryError,
}

/// Retry policy of the processor
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub max_retries: i32,
    /// Delay after a forced dead-letter
    pub retry_delay: Duration,
    pub conflict_wait: Duration,
}

impl ProcessorSettings {
    pub fn from_config(config: &ExportConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: Duration::from_secs(config.retry_delay_seconds),
            conflict_wait: config.conflict_wait(),
        }
    }
}

/// Exports the pending events of claimed KVNRs
pub struct KvnrProcessor {
    store: Arc<dyn ExportStore>,
    lookup: Arc<dyn AccountLookup>,
    decoder: EventDecoder,
    dispatcher: EventDispatcher,
    clients: Arc<dyn ClientProvider>,
    settings: ProcessorSettings,
}

impl KvnrProcessor {
    pub fn new(
        store: Arc<dyn ExportStore>,
        lookup: Arc<dyn AccountLookup>,
        decoder: EventDecoder,
        dispatcher: EventDispatcher,
        clients: Arc<dyn ClientProvider>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            store,
            lookup,
            decoder,
            dispatcher,
            clients,
            settings,
        }
    }

    /// Claims the next due KVNR and runs one pass over it
    pub async fn process_next(&self, worker: usize) -> ProcessOutcome {
        let kvnr = match self.store.claim_next_kvnr().await {
            Ok(Some(kvnr)) => kvnr,
            Ok(None) => return ProcessOutcome::NoWork,
            Err(e) => {
                tracing::error!(worker, error = %e, "Failed to claim KVNR");
                return ProcessOutcome::TemporaryError;
            }
        };
        log_kvnr_claimed!(worker, &kvnr.hashed, kvnr.retry_count);

        match self.process_one(&kvnr).await {
            Ok(summary) => {
                tracing::info!(
                    worker,
                    kvnr = %summary.kvnr,
                    delivered = summary.delivered,
                    dead_lettered = summary.dead_lettered,
                    skipped = summary.skipped,
                    purged = summary.purged,
                    result = %summary.result,
                    duration_ms = summary.duration.as_millis() as u64,
                    "KVNR pass complete"
                );
                ProcessOutcome::Immediate
            }
            Err(e) => {
                // The processing lease makes the KVNR due again later
                tracing::error!(worker, kvnr = %kvnr.hashed, error = %e, "KVNR pass failed");
                ProcessOutcome::TemporaryError
            }
        }
    }

    /// Runs one pass over a claimed KVNR
    ///
    /// # Errors
    ///
    /// Only store errors. Everything else is an outcome of the pass.
    pub async fn process_one(&self, kvnr: &EventKvnr) -> Result<PassSummary> {
        let start = Instant::now();
        let hashed = &kvnr.hashed;
        let summary = PassSummary::new(hashed.clone());

        if kvnr.retry_count > self.settings.max_retries {
            let summary = self.dead_letter_first(hashed, summary).await?;
            return Ok(summary.with_duration(start.elapsed()));
        }

        let events = self.store.pending_events(hashed).await?;
        let Some(first) = events.first() else {
            self.store.finalize_kvnr(hashed).await?;
            return Ok(summary
                .with_result(PassResult::Finalized)
                .with_duration(start.elapsed()));
        };

        let plaintext_kvnr = match self.decoder.decode_kvnr(first).await {
            Ok(plaintext_kvnr) => plaintext_kvnr,
            Err(e) => {
                tracing::error!(
                    kvnr = %hashed,
                    event_id = first.id,
                    prescription_id = %first.prescription_id,
                    error = %e,
                    "Cannot decrypt KVNR, dead-lettering prescription"
                );
                self.store
                    .mark_dead_letter(hashed, &first.prescription_id, first.prescription_type)
                    .await?;
                self.dispatcher
                    .audit_stored(first, DispatchOutcome::DeadLetter)
                    .await;
                self.store
                    .update_processing_delay(hashed, kvnr.retry_count, Duration::ZERO)
                    .await?;
                let mut summary = summary.with_result(PassResult::Undecodable);
                summary.dead_lettered += 1;
                return Ok(summary.with_duration(start.elapsed()));
            }
        };

        let account = self.lookup.lookup(&plaintext_kvnr).await;
        if account.code.reached_host() {
            self.store.record_consent_check(hashed, &account.host).await?;
        }
        tracing::debug!(kvnr = %hashed, code = %account.code, host = %account.host, "Account lookup");

        let summary = match account.code {
            LookupCode::Allowed => self.export_events(kvnr, &account, &events, summary).await?,
            LookupCode::Deny | LookupCode::NotFound => self.purge(hashed, summary).await?,
            LookupCode::Conflict => self.defer(kvnr, summary).await?,
            LookupCode::Unknown => self.reschedule(kvnr, summary).await?,
        };
        Ok(summary.with_duration(start.elapsed()))
    }

    async fn export_events(
        &self,
        kvnr: &EventKvnr,
        account: &EpaAccount,
        events: &[TaskEvent],
        summary: PassSummary,
    ) -> Result<PassSummary> {
        let mut client = self.clients.client(&account.host);
        let result = self
            .deliver_in_order(kvnr, events, client.as_mut(), summary)
            .await;
        client.finish().await;
        result
    }

    async fn deliver_in_order(
        &self,
        kvnr: &EventKvnr,
        events: &[TaskEvent],
        client: &mut dyn EpaTransport,
        mut summary: PassSummary,
    ) -> Result<PassSummary> {
        let hashed = &kvnr.hashed;
        for event in events {
            if self
                .store
                .is_dead_letter(hashed, &event.prescription_id, event.prescription_type)
                .await?
            {
                tracing::info!(
                    event_id = event.id,
                    prescription_id = %event.prescription_id,
                    "Prescription is dead-lettered, skipping event"
                );
                summary.skipped += 1;
                continue;
            }

            let decoded = match self.decoder.decode(event).await {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::error!(
                        event_id = event.id,
                        prescription_id = %event.prescription_id,
                        error = %e,
                        "Cannot decode event, dead-lettering prescription"
                    );
                    self.store
                        .mark_dead_letter(hashed, &event.prescription_id, event.prescription_type)
                        .await?;
                    self.dispatcher
                        .audit_stored(event, DispatchOutcome::DeadLetter)
                        .await;
                    summary.dead_lettered += 1;
                    continue;
                }
            };

            match self.dispatcher.dispatch(&decoded, client).await {
                DispatchOutcome::Success => {
                    self.store.delete_event(hashed, event.id).await?;
                    summary.delivered += 1;
                }
                DispatchOutcome::DeadLetter => {
                    self.store
                        .mark_dead_letter(hashed, &event.prescription_id, event.prescription_type)
                        .await?;
                    summary.dead_lettered += 1;
                }
                DispatchOutcome::Retry => return self.reschedule(kvnr, summary).await,
                DispatchOutcome::Conflict => return self.defer(kvnr, summary).await,
                DispatchOutcome::ConsentRevoked => return self.purge(hashed, summary).await,
            }
        }

        self.store.finalize_kvnr(hashed).await?;
        Ok(summary.with_result(PassResult::Finalized))
    }

    /// Deletes every event and finalizes the KVNR
    async fn purge(&self, hashed: &HashedKvnr, mut summary: PassSummary) -> Result<PassSummary> {
        summary.purged = self.store.delete_all_events(hashed).await?;
        self.store.finalize_kvnr(hashed).await?;
        Ok(summary.with_result(PassResult::Purged))
    }

    /// Comes back after the conflict wait without counting a retry
    async fn defer(&self, kvnr: &EventKvnr, summary: PassSummary) -> Result<PassSummary> {
        let delay = self.settings.conflict_wait;
        self.store
            .update_processing_delay(&kvnr.hashed, kvnr.retry_count, delay)
            .await?;
        Ok(summary.with_result(PassResult::Deferred { delay }))
    }

    /// Schedules the next pass with backoff from the current retry count
    async fn reschedule(&self, kvnr: &EventKvnr, summary: PassSummary) -> Result<PassSummary> {
        let retry_count = kvnr.retry_count.saturating_add(1);
        if retry_count > self.settings.max_retries {
            return self.dead_letter_first(&kvnr.hashed, summary).await;
        }

        let delay = backoff(kvnr.retry_count);
        self.store
            .update_processing_delay(&kvnr.hashed, retry_count, delay)
            .await?;
        tracing::info!(
            kvnr = %kvnr.hashed,
            retry_count,
            delay_secs = delay.as_secs(),
            "KVNR rescheduled"
        );
        Ok(summary.with_result(PassResult::Rescheduled { retry_count, delay }))
    }

    /// Dead-letters the oldest pending event and restarts the retry count
    async fn dead_letter_first(
        &self,
        hashed: &HashedKvnr,
        mut summary: PassSummary,
    ) -> Result<PassSummary> {
        if let Some(event) = self.store.mark_first_event_dead_letter(hashed).await? {
            tracing::warn!(
                kvnr = %hashed,
                event_id = event.id,
                prescription_id = %event.prescription_id,
                max_retries = self.settings.max_retries,
                "Retries exhausted, dead-lettering oldest event"
            );
            self.dispatcher
                .audit_stored(&event, DispatchOutcome::DeadLetter)
                .await;
            summary.dead_lettered += 1;
        }
        self.store
            .update_processing_delay(hashed, 0, self.settings.retry_delay)
            .await?;
        Ok(summary.with_result(PassResult::RetriesExhausted))
    }
}

#[async_trait]
impl WorkSource for KvnrProcessor {
    async fn process_next(&self, worker: usize) -> ProcessOutcome {
        KvnrProcessor::process_next(self, worker).await
    }
}
