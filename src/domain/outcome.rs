//! Dispatch outcomes and audit records

use super::ids::{HashedKvnr, PrescriptionId};
use super::task_event::UseCase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result of attempting to deliver one event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DispatchOutcome {
    /// Delivered, the row can go
    Success,
    /// Transient failure, reschedule the KVNR
    Retry,
    /// Permanent rejection, quarantine the prescription
    DeadLetter,
    /// The record is being relocated, wait the conflict window
    Conflict,
    /// The insurant withdrew consent, purge the KVNR
    ConsentRevoked,
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DispatchOutcome::Success => "success",
            DispatchOutcome::Retry => "retry",
            DispatchOutcome::DeadLetter => "deadLetter",
            DispatchOutcome::Conflict => "conflict",
            DispatchOutcome::ConsentRevoked => "consentRevoked",
        };
        f.write_str(s)
    }
}

/// What the audited operation did to the insurant's record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    /// Provide operations
    Create,
    /// Cancel operations
    Delete,
}

impl From<UseCase> for AuditAction {
    fn from(use_case: UseCase) -> Self {
        match use_case {
            UseCase::ProvidePrescription | UseCase::ProvideDispensation => AuditAction::Create,
            UseCase::CancelPrescription | UseCase::CancelDispensation => AuditAction::Delete,
        }
    }
}

/// One audit entry per delivery attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub event_id: i64,
    pub use_case: UseCase,
    pub prescription_id: PrescriptionId,
    pub hashed_kvnr: HashedKvnr,
    pub outcome: DispatchOutcome,
    pub http_status: Option<u16>,
    pub action: AuditAction,
    pub recorded_at: DateTime<Utc>,
}
