//! Decoded export events
//!
//! [`ExportEvent`] is the decrypted form of a [`crate::domain::TaskEvent`],
//! one variant per use case, each carrying exactly the material its ePA
//! operation needs.

use super::ids::{HashedKvnr, Kvnr, PrescriptionId};
use super::task_event::{PrescriptionType, UseCase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attributes shared by every use case
#[derive(Debug, Clone, PartialEq)]
pub struct EventCommon {
    /// Row id of the stored event
    pub id: i64,
    /// Prescription the event belongs to
    pub prescription_id: PrescriptionId,
    /// Flow type of the prescription
    pub prescription_type: PrescriptionType,
    /// Plaintext KVNR
    pub kvnr: Kvnr,
    /// KVNR hash
    pub hashed_kvnr: HashedKvnr,
    /// Ordering key within a prescription
    pub last_modified: DateTime<Utc>,
    /// When the prescription was authored
    pub authored_on: DateTime<Utc>,
}

/// Prescriber or pharmacy identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderIdentity {
    /// Telematik-ID of the institution
    pub telematik_id: String,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Profession OID
    #[serde(default)]
    pub oid: Option<String>,
}

/// A decoded event, ready for dispatch
#[derive(Debug, Clone, PartialEq)]
pub enum ExportEvent {
    /// Activated prescription with its KBV bundle
    ProvidePrescription {
        common: EventCommon,
        prescription: serde_json::Value,
        practitioner: ProviderIdentity,
    },
    /// Dispensed medication with its dispense bundle
    ProvideDispensation {
        common: EventCommon,
        dispensation: serde_json::Value,
        pharmacy: ProviderIdentity,
    },
    /// Withdrawn prescription
    CancelPrescription { common: EventCommon },
    /// Withdrawn dispensation
    CancelDispensation { common: EventCommon },
}

impl ExportEvent {
    /// Attributes shared by every use case
    pub fn common(&self) -> &EventCommon {
        match self {
            ExportEvent::ProvidePrescription { common, .. }
            | ExportEvent::ProvideDispensation { common, .. }
            | ExportEvent::CancelPrescription { common }
            | ExportEvent::CancelDispensation { common } => common,
        }
    }

    /// The use case this variant represents
    pub fn use_case(&self) -> UseCase {
        match self {
            ExportEvent::ProvidePrescription { .. } => UseCase::ProvidePrescription,
            ExportEvent::ProvideDispensation { .. } => UseCase::ProvideDispensation,
            ExportEvent::CancelPrescription { .. } => UseCase::CancelPrescription,
            ExportEvent::CancelDispensation { .. } => UseCase::CancelDispensation,
        }
    }
}
