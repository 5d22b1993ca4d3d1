//! Stored task events
//!
//! A [`TaskEvent`] is one row of the `task_event` table: an outbound
//! medication event with its payload still encrypted. Decryption and decoding
//! into an [`crate::domain::ExportEvent`] happen in the export core.

use super::ids::{HashedKvnr, PrescriptionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which ePA medication operation an event maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UseCase {
    /// A prescription was activated
    ProvidePrescription,
    /// A prescription was aborted or deleted
    CancelPrescription,
    /// Medication was dispensed
    ProvideDispensation,
    /// A dispensation was withdrawn
    CancelDispensation,
}

impl UseCase {
    /// Returns the value stored in the `usecase` column
    pub fn as_str(&self) -> &'static str {
        match self {
            UseCase::ProvidePrescription => "providePrescription",
            UseCase::CancelPrescription => "cancelPrescription",
            UseCase::ProvideDispensation => "provideDispensation",
            UseCase::CancelDispensation => "cancelDispensation",
        }
    }

    /// FHIR operation path on the ePA medication service
    pub fn operation_path(&self) -> &'static str {
        match self {
            UseCase::ProvidePrescription => {
                "/epa/medication/api/v1/fhir/$provide-prescription-erp"
            }
            UseCase::CancelPrescription => "/epa/medication/api/v1/fhir/$cancel-prescription-erp",
            UseCase::ProvideDispensation => {
                "/epa/medication/api/v1/fhir/$provide-dispensation-erp"
            }
            UseCase::CancelDispensation => "/epa/medication/api/v1/fhir/$cancel-dispensation-erp",
        }
    }
}

impl fmt::Display for UseCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UseCase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "providePrescription" => Ok(UseCase::ProvidePrescription),
            "cancelPrescription" => Ok(UseCase::CancelPrescription),
            "provideDispensation" => Ok(UseCase::ProvideDispensation),
            "cancelDispensation" => Ok(UseCase::CancelDispensation),
            other => Err(format!("Unknown use case: {other}")),
        }
    }
}

/// Prescription flow type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrescriptionType {
    /// 160: pharmacy-only medicinal products
    ApothekenpflichtigeArzneimittel,
    /// 162: digital health applications
    DigitaleGesundheitsanwendungen,
    /// 169: direct assignment
    DirekteZuweisung,
    /// 200: private insurance
    ApothekenpflichtigeArzneimittelPkv,
    /// 209: private insurance, direct assignment
    DirekteZuweisungPkv,
}

impl PrescriptionType {
    /// Numeric flow type as stored in `prescription_type`
    pub fn code(&self) -> i16 {
        match self {
            PrescriptionType::ApothekenpflichtigeArzneimittel => 160,
            PrescriptionType::DigitaleGesundheitsanwendungen => 162,
            PrescriptionType::DirekteZuweisung => 169,
            PrescriptionType::ApothekenpflichtigeArzneimittelPkv => 200,
            PrescriptionType::DirekteZuweisungPkv => 209,
        }
    }

    /// Maps a stored flow type code
    pub fn from_code(code: i16) -> Result<Self, String> {
        match code {
            160 => Ok(PrescriptionType::ApothekenpflichtigeArzneimittel),
            162 => Ok(PrescriptionType::DigitaleGesundheitsanwendungen),
            169 => Ok(PrescriptionType::DirekteZuweisung),
            200 => Ok(PrescriptionType::ApothekenpflichtigeArzneimittelPkv),
            209 => Ok(PrescriptionType::DirekteZuweisungPkv),
            other => Err(format!("Unknown prescription type: {other}")),
        }
    }
}

impl fmt::Display for PrescriptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Event row state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventState {
    /// Waiting for export
    Pending,
    /// Quarantined, kept for inspection
    DeadLetterQueue,
}

impl EventState {
    /// Returns the value stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            EventState::Pending => "pending",
            EventState::DeadLetterQueue => "deadLetterQueue",
        }
    }
}

impl FromStr for EventState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventState::Pending),
            "deadLetterQueue" => Ok(EventState::DeadLetterQueue),
            other => Err(format!("Unknown event state: {other}")),
        }
    }
}

/// Key derivation metadata stored next to an encrypted blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobKeyRef {
    /// Identifier of the derivation key generation
    pub blob_id: i32,
    /// Per-row salt
    pub salt: Vec<u8>,
}

/// One stored event row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    /// Row id
    pub id: i64,

    /// Prescription the event belongs to
    pub prescription_id: PrescriptionId,

    /// Flow type of the prescription
    pub prescription_type: PrescriptionType,

    /// KVNR, encrypted with the task key
    pub kvnr_encrypted: Vec<u8>,

    /// KVNR hash, foreign key to the `kvnr` table
    pub hashed_kvnr: HashedKvnr,

    /// Row state
    pub state: EventState,

    /// ePA operation
    pub use_case: UseCase,

    /// Ordering key within a prescription
    pub last_modified: DateTime<Utc>,

    /// When the prescription was authored
    pub authored_on: DateTime<Utc>,

    /// Key metadata for the task blobs (KVNR, prescription bundle, identities)
    pub task_key: BlobKeyRef,

    /// Encrypted prescription bundle
    pub prescription_bundle: Option<Vec<u8>>,

    /// Key metadata for the dispense bundle
    pub medication_dispense_key: Option<BlobKeyRef>,

    /// Encrypted dispense bundle
    pub medication_dispense_bundle: Option<Vec<u8>>,

    /// Encrypted prescriber identity
    pub doctor_identity: Option<Vec<u8>>,

    /// Encrypted pharmacy identity
    pub pharmacy_identity: Option<Vec<u8>>,
}

impl TaskEvent {
    /// The grouping used for dead-lettering
    pub fn prescription_key(&self) -> (&PrescriptionId, PrescriptionType) {
        (&self.prescription_id, self.prescription_type)
    }
}
