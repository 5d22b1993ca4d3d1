//! One delivery attempt of one event

use super::client::EpaTransport;
use crate::adapters::codec::PayloadCodec;
use crate::adapters::database::AuditSink;
use crate::domain::{AuditAction, AuditRecord, DispatchOutcome, ExportEvent, TaskEvent};
use crate::log_dispatch_outcome;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// Maps the inner HTTP status of an ePA response to an outcome
///
/// Business rejections quarantine the prescription, 403 means the insurant
/// withdrew consent and 409 that the record is being relocated. Everything
/// else outside 2xx is retried.
pub fn classify(status: u16) -> DispatchOutcome {
    match status {
        200..=299 => DispatchOutcome::Success,
        400 | 404 | 405 | 410 | 422 => DispatchOutcome::DeadLetter,
        403 => DispatchOutcome::ConsentRevoked,
        409 => DispatchOutcome::Conflict,
        _ => DispatchOutcome::Retry,
    }
}

/// Encodes events, sends them and audits every attempt
pub struct EventDispatcher {
    codec: Arc<dyn PayloadCodec>,
    audit_sink: Arc<dyn AuditSink>,
}

impl EventDispatcher {
    pub fn new(codec: Arc<dyn PayloadCodec>, audit_sink: Arc<dyn AuditSink>) -> Self {
        Self { codec, audit_sink }
    }

    /// Delivers `event` over `transport`
    ///
    /// Never fails: encoding and transport errors are [`DispatchOutcome::Retry`].
    pub async fn dispatch(
        &self,
        event: &ExportEvent,
        transport: &mut dyn EpaTransport,
    ) -> DispatchOutcome {
        let common = event.common();
        let use_case = event.use_case();
        let request_id = Uuid::new_v4().to_string();

        let (outcome, status) = match self.codec.encode(event) {
            Ok(payload) => match transport
                .send(use_case, &common.kvnr, payload, &request_id)
                .await
            {
                Ok(response) => (classify(response.status), Some(response.status)),
                Err(e) => {
                    tracing::warn!(
                        prescription_id = %common.prescription_id,
                        request_id = %request_id,
                        error = %e,
                        "Event delivery failed"
                    );
                    (DispatchOutcome::Retry, None)
                }
            },
            Err(e) => {
                tracing::error!(
                    prescription_id = %common.prescription_id,
                    error = %e,
                    "Failed to encode event payload"
                );
                (DispatchOutcome::Retry, None)
            }
        };

        log_dispatch_outcome!(use_case, common.prescription_id, outcome, status);
        self.audit(event, outcome, status).await;
        outcome
    }

    /// Appends the audit record of a delivery attempt
    pub async fn audit(&self, event: &ExportEvent, outcome: DispatchOutcome, status: Option<u16>) {
        let common = event.common();
        self.append(AuditRecord {
            event_id: common.id,
            use_case: event.use_case(),
            prescription_id: common.prescription_id.clone(),
            hashed_kvnr: common.hashed_kvnr.clone(),
            outcome,
            http_status: status,
            action: AuditAction::from(event.use_case()),
            recorded_at: Utc::now(),
        })
        .await;
    }

    /// Appends the audit record of a stored event that was never sent
    pub async fn audit_stored(&self, event: &TaskEvent, outcome: DispatchOutcome) {
        self.append(AuditRecord {
            event_id: event.id,
            use_case: event.use_case,
            prescription_id: event.prescription_id.clone(),
            hashed_kvnr: event.hashed_kvnr.clone(),
            outcome,
            http_status: None,
            action: AuditAction::from(event.use_case),
            recorded_at: Utc::now(),
        })
        .await;
    }

    async fn append(&self, record: AuditRecord) {
        let event_id = record.event_id;
        if let Err(e) = self.audit_sink.append(record).await {
            tracing::error!(event_id, error = %e, "Failed to write audit record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::codec::JsonPayloadCodec;
    use crate::adapters::database::MemoryExportStore;
    use crate::core::export::client::EpaResponse;
    use crate::domain::{
        EventCommon, ExporterError, HashedKvnr, Kvnr, PrescriptionId, PrescriptionType, Result,
        Tee3Error, UseCase,
    };
    use async_trait::async_trait;
    use test_case::test_case;

    struct ScriptedTransport {
        reply: std::result::Result<u16, Tee3Error>,
        sent: Vec<(UseCase, String)>,
    }

    #[async_trait]
    impl EpaTransport for ScriptedTransport {
        async fn send(
            &mut self,
            use_case: UseCase,
            kvnr: &Kvnr,
            _payload: Vec<u8>,
            _request_id: &str,
        ) -> std::result::Result<EpaResponse, Tee3Error> {
            self.sent.push((use_case, kvnr.as_str().to_string()));
            self.reply.clone().map(|status| EpaResponse {
                status,
                body: Vec::new(),
            })
        }

        async fn finish(&mut self) {}
    }

    struct FailingAudit;

    #[async_trait]
    impl AuditSink for FailingAudit {
        async fn append(&self, _record: AuditRecord) -> Result<()> {
            Err(ExporterError::Audit("sink offline".to_string()))
        }
    }

    fn cancel_event() -> ExportEvent {
        ExportEvent::CancelPrescription {
            common: EventCommon {
                id: 3,
                prescription_id: PrescriptionId::new("160.000.100.000.001.05").unwrap(),
                prescription_type: PrescriptionType::ApothekenpflichtigeArzneimittel,
                kvnr: Kvnr::new("X123456789").unwrap(),
                hashed_kvnr: HashedKvnr::from_bytes(vec![1u8; 32]),
                last_modified: Utc::now(),
                authored_on: Utc::now(),
            },
        }
    }

    #[test_case(200, DispatchOutcome::Success ; "ok")]
    #[test_case(201, DispatchOutcome::Success ; "created")]
    #[test_case(204, DispatchOutcome::Success ; "no content")]
    #[test_case(400, DispatchOutcome::DeadLetter ; "bad request")]
    #[test_case(404, DispatchOutcome::DeadLetter ; "not found")]
    #[test_case(405, DispatchOutcome::DeadLetter ; "method not allowed")]
    #[test_case(410, DispatchOutcome::DeadLetter ; "gone")]
    #[test_case(422, DispatchOutcome::DeadLetter ; "unprocessable")]
    #[test_case(403, DispatchOutcome::ConsentRevoked ; "forbidden")]
    #[test_case(409, DispatchOutcome::Conflict ; "conflict")]
    #[test_case(408, DispatchOutcome::Retry ; "request timeout")]
    #[test_case(423, DispatchOutcome::Retry ; "locked")]
    #[test_case(429, DispatchOutcome::Retry ; "too many requests")]
    #[test_case(500, DispatchOutcome::Retry ; "server error")]
    #[test_case(503, DispatchOutcome::Retry ; "unavailable")]
    #[test_case(302, DispatchOutcome::Retry ; "redirect")]
    fn test_classify(status: u16, expected: DispatchOutcome) {
        assert_eq!(classify(status), expected);
    }

    #[tokio::test]
    async fn test_dispatch_audits_success() {
        let store = Arc::new(MemoryExportStore::new());
        let dispatcher = EventDispatcher::new(Arc::new(JsonPayloadCodec), store.clone());
        let mut transport = ScriptedTransport {
            reply: Ok(200),
            sent: Vec::new(),
        };

        let outcome = dispatcher.dispatch(&cancel_event(), &mut transport).await;
        assert_eq!(outcome, DispatchOutcome::Success);
        assert_eq!(
            transport.sent,
            vec![(UseCase::CancelPrescription, "X123456789".to_string())]
        );

        let records = store.audit_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_id, 3);
        assert_eq!(records[0].outcome, DispatchOutcome::Success);
        assert_eq!(records[0].http_status, Some(200));
        assert_eq!(records[0].action, AuditAction::Delete);
    }

    #[tokio::test]
    async fn test_transport_error_is_retry() {
        let store = Arc::new(MemoryExportStore::new());
        let dispatcher = EventDispatcher::new(Arc::new(JsonPayloadCodec), store.clone());
        let mut transport = ScriptedTransport {
            reply: Err(Tee3Error::Timeout("read".to_string())),
            sent: Vec::new(),
        };

        let outcome = dispatcher.dispatch(&cancel_event(), &mut transport).await;
        assert_eq!(outcome, DispatchOutcome::Retry);
        let records = store.audit_records().await;
        assert_eq!(records[0].outcome, DispatchOutcome::Retry);
        assert_eq!(records[0].http_status, None);
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_change_outcome() {
        let dispatcher = EventDispatcher::new(Arc::new(JsonPayloadCodec), Arc::new(FailingAudit));
        let mut transport = ScriptedTransport {
            reply: Ok(422),
            sent: Vec::new(),
        };

        let outcome = dispatcher.dispatch(&cancel_event(), &mut transport).await;
        assert_eq!(outcome, DispatchOutcome::DeadLetter);
    }
}
