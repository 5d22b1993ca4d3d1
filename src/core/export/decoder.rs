//! Stored rows to decoded export events
//!
//! The KVNR, the prescription bundle and the provider identities are
//! encrypted with the task key of the row. The dispense bundle has its own
//! key.

use crate::adapters::codec::PayloadCodec;
use crate::adapters::crypto::{decrypt_blob, KeyDerivation, KeyPurpose};
use crate::domain::{
    EventCommon, ExportEvent, ExporterError, Kvnr, ProviderIdentity, Result, TaskEvent, UseCase,
};
use std::sync::Arc;

/// Decrypts and decodes [`TaskEvent`] rows
pub struct EventDecoder {
    keys: Arc<dyn KeyDerivation>,
    codec: Arc<dyn PayloadCodec>,
}

impl EventDecoder {
    pub fn new(keys: Arc<dyn KeyDerivation>, codec: Arc<dyn PayloadCodec>) -> Self {
        Self { keys, codec }
    }

    /// Decrypts only the KVNR of a row
    pub async fn decode_kvnr(&self, event: &TaskEvent) -> Result<Kvnr> {
        let key = self.keys.derive_key(KeyPurpose::Task, &event.task_key).await?;
        let plaintext = decrypt_blob(&key, &event.kvnr_encrypted)?;
        let kvnr = std::str::from_utf8(&plaintext)
            .map_err(|_| ExporterError::Codec("KVNR is not UTF-8".to_string()))?;
        Kvnr::new(kvnr).map_err(ExporterError::Codec)
    }

    /// Decodes a row into the event of its use case
    ///
    /// # Errors
    ///
    /// [`ExporterError::Codec`] when material the use case needs is missing
    /// or malformed, [`ExporterError::Crypto`] when a blob does not decrypt.
    pub async fn decode(&self, event: &TaskEvent) -> Result<ExportEvent> {
        let task_key = self.keys.derive_key(KeyPurpose::Task, &event.task_key).await?;
        let kvnr = {
            let plaintext = decrypt_blob(&task_key, &event.kvnr_encrypted)?;
            let kvnr = std::str::from_utf8(&plaintext)
                .map_err(|_| ExporterError::Codec("KVNR is not UTF-8".to_string()))?;
            Kvnr::new(kvnr).map_err(ExporterError::Codec)?
        };

        let common = EventCommon {
            id: event.id,
            prescription_id: event.prescription_id.clone(),
            prescription_type: event.prescription_type,
            kvnr,
            hashed_kvnr: event.hashed_kvnr.clone(),
            last_modified: event.last_modified,
            authored_on: event.authored_on,
        };

        let decoded = match event.use_case {
            UseCase::ProvidePrescription => {
                let bundle = required(&event.prescription_bundle, "prescription bundle", event)?;
                let prescription = self
                    .codec
                    .decode_bundle(&decrypt_blob(&task_key, bundle)?)?;
                let identity = required(&event.doctor_identity, "doctor identity", event)?;
                let practitioner = identity_from(&decrypt_blob(&task_key, identity)?)?;
                ExportEvent::ProvidePrescription {
                    common,
                    prescription,
                    practitioner,
                }
            }
            UseCase::ProvideDispensation => {
                let key_ref = event.medication_dispense_key.as_ref().ok_or_else(|| {
                    missing("medication dispense key", event)
                })?;
                let dispense_key = self
                    .keys
                    .derive_key(KeyPurpose::MedicationDispense, key_ref)
                    .await?;
                let bundle = required(
                    &event.medication_dispense_bundle,
                    "medication dispense bundle",
                    event,
                )?;
                let dispensation = self
                    .codec
                    .decode_bundle(&decrypt_blob(&dispense_key, bundle)?)?;
                let identity = required(&event.pharmacy_identity, "pharmacy identity", event)?;
                let pharmacy = identity_from(&decrypt_blob(&task_key, identity)?)?;
                ExportEvent::ProvideDispensation {
                    common,
                    dispensation,
                    pharmacy,
                }
            }
            UseCase::CancelPrescription => ExportEvent::CancelPrescription { common },
            UseCase::CancelDispensation => ExportEvent::CancelDispensation { common },
        };
        Ok(decoded)
    }
}

fn required<'a>(field: &'a Option<Vec<u8>>, name: &str, event: &TaskEvent) -> Result<&'a [u8]> {
    field
        .as_deref()
        .ok_or_else(|| missing(name, event))
}

fn missing(name: &str, event: &TaskEvent) -> ExporterError {
    ExporterError::Codec(format!(
        "Event {} ({}) has no {}",
        event.id, event.use_case, name
    ))
}

fn identity_from(bytes: &[u8]) -> Result<ProviderIdentity> {
    serde_json::from_slice(bytes)
        .map_err(|e| ExporterError::Codec(format!("Malformed provider identity: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::codec::JsonPayloadCodec;
    use crate::adapters::crypto::{encrypt_blob, HkdfKeyDerivation};
    use crate::domain::{BlobKeyRef, EventState, HashedKvnr, PrescriptionId, PrescriptionType};
    use chrono::Utc;
    use serde_json::json;
    use zeroize::Zeroizing;

    fn keys() -> Arc<HkdfKeyDerivation> {
        Arc::new(HkdfKeyDerivation::new(Zeroizing::new(vec![9u8; 32])).unwrap())
    }

    fn decoder() -> EventDecoder {
        EventDecoder::new(keys(), Arc::new(JsonPayloadCodec))
    }

    async fn encrypt(purpose: KeyPurpose, key_ref: &BlobKeyRef, plaintext: &[u8]) -> Vec<u8> {
        let key = keys().derive_key(purpose, key_ref).await.unwrap();
        encrypt_blob(&key, plaintext).unwrap()
    }

    async fn event(use_case: UseCase) -> TaskEvent {
        let task_key = BlobKeyRef {
            blob_id: 4,
            salt: vec![1u8; 16],
        };
        TaskEvent {
            id: 17,
            prescription_id: PrescriptionId::new("160.000.100.000.001.05").unwrap(),
            prescription_type: PrescriptionType::ApothekenpflichtigeArzneimittel,
            kvnr_encrypted: encrypt(KeyPurpose::Task, &task_key, b"X123456789").await,
            hashed_kvnr: HashedKvnr::from_bytes(vec![0xaa; 32]),
            state: EventState::Pending,
            use_case,
            last_modified: Utc::now(),
            authored_on: Utc::now(),
            task_key,
            prescription_bundle: None,
            medication_dispense_key: None,
            medication_dispense_bundle: None,
            doctor_identity: None,
            pharmacy_identity: None,
        }
    }

    #[tokio::test]
    async fn test_decode_kvnr() {
        let event = event(UseCase::CancelPrescription).await;
        let kvnr = decoder().decode_kvnr(&event).await.unwrap();
        assert_eq!(kvnr.as_str(), "X123456789");
    }

    #[tokio::test]
    async fn test_decode_cancellation() {
        let event = event(UseCase::CancelDispensation).await;
        let decoded = decoder().decode(&event).await.unwrap();
        assert_eq!(decoded.use_case(), UseCase::CancelDispensation);
        assert_eq!(decoded.common().id, 17);
    }

    #[tokio::test]
    async fn test_decode_prescription() {
        let mut event = event(UseCase::ProvidePrescription).await;
        let bundle = json!({"resourceType": "Bundle", "entry": []}).to_string();
        let identity = json!({"telematikId": "1-HBA-Testkarte-883110000129070"}).to_string();
        event.prescription_bundle =
            Some(encrypt(KeyPurpose::Task, &event.task_key, bundle.as_bytes()).await);
        event.doctor_identity =
            Some(encrypt(KeyPurpose::Task, &event.task_key, identity.as_bytes()).await);

        match decoder().decode(&event).await.unwrap() {
            ExportEvent::ProvidePrescription { practitioner, .. } => {
                assert_eq!(practitioner.telematik_id, "1-HBA-Testkarte-883110000129070");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispensation_uses_dispense_key() {
        let mut event = event(UseCase::ProvideDispensation).await;
        let dispense_key = BlobKeyRef {
            blob_id: 5,
            salt: vec![2u8; 16],
        };
        let bundle = json!({"resourceType": "Bundle"}).to_string();
        let identity = json!({"telematikId": "3-SMC-B-Testkarte-883110000095957"}).to_string();
        event.medication_dispense_bundle = Some(
            encrypt(KeyPurpose::MedicationDispense, &dispense_key, bundle.as_bytes()).await,
        );
        event.medication_dispense_key = Some(dispense_key);
        event.pharmacy_identity =
            Some(encrypt(KeyPurpose::Task, &event.task_key, identity.as_bytes()).await);

        let decoded = decoder().decode(&event).await.unwrap();
        assert_eq!(decoded.use_case(), UseCase::ProvideDispensation);
    }

    #[tokio::test]
    async fn test_missing_bundle_is_codec_error() {
        let event = event(UseCase::ProvidePrescription).await;
        let result = decoder().decode(&event).await;
        assert!(matches!(result, Err(ExporterError::Codec(msg)) if msg.contains("prescription bundle")));
    }

    #[tokio::test]
    async fn test_wrong_key_is_crypto_error() {
        let mut event = event(UseCase::CancelPrescription).await;
        event.task_key.salt = vec![3u8; 16];
        assert!(matches!(
            decoder().decode(&event).await,
            Err(ExporterError::Crypto(_))
        ));
    }
}
