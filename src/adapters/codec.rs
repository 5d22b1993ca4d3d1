//! FHIR payload codec
//!
//! Turns decrypted bundles into JSON values and decoded events into the FHIR
//! `Parameters` bodies of the ePA medication operations.

use crate::domain::{EventCommon, ExportEvent, ExporterError, ProviderIdentity, Result};
use serde_json::{json, Value};

const PRESCRIPTION_ID_SYSTEM: &str = "https://gematik.de/fhir/erp/NamingSystem/GEM_ERP_NS_PrescriptionId";
const TELEMATIK_ID_SYSTEM: &str = "https://gematik.de/fhir/sid/telematik-id";

/// Decodes stored bundles and encodes request bodies
pub trait PayloadCodec: Send + Sync {
    /// Parses a decrypted prescription or dispense bundle
    fn decode_bundle(&self, bytes: &[u8]) -> Result<Value>;

    /// Builds the request body for an event
    fn encode(&self, event: &ExportEvent) -> Result<Vec<u8>>;
}

/// JSON codec producing FHIR `Parameters` resources
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonPayloadCodec;

impl PayloadCodec for JsonPayloadCodec {
    fn decode_bundle(&self, bytes: &[u8]) -> Result<Value> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| ExporterError::Codec(format!("Bundle is not valid JSON: {e}")))?;
        match value.get("resourceType").and_then(Value::as_str) {
            Some("Bundle") => Ok(value),
            Some(other) => Err(ExporterError::Codec(format!(
                "Expected a Bundle, got {other}"
            ))),
            None => Err(ExporterError::Codec(
                "Bundle has no resourceType".to_string(),
            )),
        }
    }

    fn encode(&self, event: &ExportEvent) -> Result<Vec<u8>> {
        let parameter = match event {
            ExportEvent::ProvidePrescription {
                common,
                prescription,
                practitioner,
            } => {
                let mut parts = identification_parts(common);
                parts.extend(bundle_parts(
                    prescription,
                    &["MedicationRequest", "Medication", "Practitioner"],
                )?);
                parts.push(organization_part(practitioner));
                json!({ "name": "rxPrescription", "part": parts })
            }
            ExportEvent::ProvideDispensation {
                common,
                dispensation,
                pharmacy,
            } => {
                let mut parts = identification_parts(common);
                parts.extend(bundle_parts(dispensation, &["MedicationDispense", "Medication"])?);
                parts.push(organization_part(pharmacy));
                json!({ "name": "rxDispensation", "part": parts })
            }
            ExportEvent::CancelPrescription { common } => {
                json!({ "name": "rxPrescription", "part": identification_parts(common) })
            }
            ExportEvent::CancelDispensation { common } => {
                json!({ "name": "rxDispensation", "part": identification_parts(common) })
            }
        };

        let body = json!({
            "resourceType": "Parameters",
            "parameter": [parameter],
        });
        Ok(serde_json::to_vec(&body)?)
    }
}

fn identification_parts(common: &EventCommon) -> Vec<Value> {
    vec![
        json!({
            "name": "prescriptionId",
            "valueIdentifier": {
                "system": PRESCRIPTION_ID_SYSTEM,
                "value": common.prescription_id.as_str(),
            },
        }),
        json!({
            "name": "authoredOn",
            "valueDate": common.authored_on.format("%Y-%m-%d").to_string(),
        }),
    ]
}

/// Picks the resources of the given types out of a bundle, in bundle order
fn bundle_parts(bundle: &Value, resource_types: &[&str]) -> Result<Vec<Value>> {
    let entries = bundle
        .get("entry")
        .and_then(Value::as_array)
        .ok_or_else(|| ExporterError::Codec("Bundle has no entries".to_string()))?;

    let parts: Vec<Value> = entries
        .iter()
        .filter_map(|entry| entry.get("resource"))
        .filter_map(|resource| {
            let resource_type = resource.get("resourceType")?.as_str()?;
            resource_types
                .contains(&resource_type)
                .then(|| json!({ "name": part_name(resource_type), "resource": resource }))
        })
        .collect();

    if parts.is_empty() {
        return Err(ExporterError::Codec(format!(
            "Bundle contains none of {}",
            resource_types.join(", ")
        )));
    }
    Ok(parts)
}

fn part_name(resource_type: &str) -> String {
    let mut chars = resource_type.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn organization_part(identity: &ProviderIdentity) -> Value {
    let mut organization = json!({
        "resourceType": "Organization",
        "identifier": [{
            "system": TELEMATIK_ID_SYSTEM,
            "value": identity.telematik_id,
        }],
    });
    if let Some(name) = &identity.name {
        organization["name"] = json!(name);
    }
    if let Some(oid) = &identity.oid {
        organization["type"] = json!([{ "coding": [{ "code": oid }] }]);
    }
    json!({ "name": "organization", "resource": organization })
}
