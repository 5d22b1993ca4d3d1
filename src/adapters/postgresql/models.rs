//! Row mapping for the `erp_event` schema

use crate::domain::{
    BlobKeyRef, EventKvnr, EventState, ExporterError, HashedKvnr, KvnrState, PrescriptionId,
    PrescriptionType, Result, TaskEvent, UseCase,
};
use std::str::FromStr;
use tokio_postgres::Row;

/// Columns selected for a [`TaskEvent`], in the order [`task_event_from_row`] reads them
pub const TASK_EVENT_COLUMNS: &str = "id, prescription_id, prescription_type, kvnr, kvnr_hashed, \
     state, usecase, last_modified, authored_on, salt, key_blob_id, \
     healthcare_provider_prescription, medication_dispense_salt, medication_dispense_blob_id, \
     medication_dispense_bundle, qes_doctor_id, pharmacy_id";

/// Columns returned for an [`EventKvnr`]
pub const KVNR_COLUMNS: &str =
    "kvnr_hashed, state, retry_count, next_export, last_consent_check, assigned_epa";

fn column<'a, T: tokio_postgres::types::FromSql<'a>>(row: &'a Row, name: &str) -> Result<T> {
    row.try_get(name)
        .map_err(|e| ExporterError::Database(format!("Failed to read column {name}: {e}")))
}

/// Maps a `task_event` row
pub fn task_event_from_row(row: &Row) -> Result<TaskEvent> {
    let prescription_id: String = column(row, "prescription_id")?;
    let prescription_type: i16 = column(row, "prescription_type")?;
    let state: String = column(row, "state")?;
    let use_case: String = column(row, "usecase")?;

    let dispense_salt: Option<Vec<u8>> = column(row, "medication_dispense_salt")?;
    let dispense_blob_id: Option<i32> = column(row, "medication_dispense_blob_id")?;
    let medication_dispense_key = match (dispense_blob_id, dispense_salt) {
        (Some(blob_id), Some(salt)) => Some(BlobKeyRef { blob_id, salt }),
        _ => None,
    };

    Ok(TaskEvent {
        id: column(row, "id")?,
        prescription_id: PrescriptionId::new(prescription_id).map_err(ExporterError::Database)?,
        prescription_type: PrescriptionType::from_code(prescription_type)
            .map_err(ExporterError::Database)?,
        kvnr_encrypted: column(row, "kvnr")?,
        hashed_kvnr: HashedKvnr::from_bytes(column::<Vec<u8>>(row, "kvnr_hashed")?),
        state: EventState::from_str(&state).map_err(ExporterError::Database)?,
        use_case: UseCase::from_str(&use_case).map_err(ExporterError::Database)?,
        last_modified: column(row, "last_modified")?,
        authored_on: column(row, "authored_on")?,
        task_key: BlobKeyRef {
            blob_id: column(row, "key_blob_id")?,
            salt: column(row, "salt")?,
        },
        prescription_bundle: column(row, "healthcare_provider_prescription")?,
        medication_dispense_key,
        medication_dispense_bundle: column(row, "medication_dispense_bundle")?,
        doctor_identity: column(row, "qes_doctor_id")?,
        pharmacy_identity: column(row, "pharmacy_id")?,
    })
}

/// Maps a `kvnr` row
pub fn kvnr_from_row(row: &Row) -> Result<EventKvnr> {
    let state: String = column(row, "state")?;
    Ok(EventKvnr {
        hashed: HashedKvnr::from_bytes(column::<Vec<u8>>(row, "kvnr_hashed")?),
        state: KvnrState::from_str(&state).map_err(ExporterError::Database)?,
        retry_count: column(row, "retry_count")?,
        next_export: column(row, "next_export")?,
        last_consent_check: column(row, "last_consent_check")?,
        assigned_epa: column(row, "assigned_epa")?,
    })
}
