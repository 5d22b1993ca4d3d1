//! Shared setup for the integration tests
//!
//! Wires the real processor, dispatcher and TEE3 stack to an in-memory store
//! and an in-process responder.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use medication_exporter::adapters::codec::JsonPayloadCodec;
use medication_exporter::adapters::crypto::{
    encrypt_blob, HkdfKeyDerivation, KeyDerivation, KeyPurpose, SymmetricKey,
};
use medication_exporter::adapters::database::{ExportStore, MemoryExportStore};
use medication_exporter::adapters::epa::AccountLookup;
use medication_exporter::core::export::{
    EventDecoder, EventDispatcher, KvnrProcessor, ProcessorSettings, RegistryClientProvider,
};
use medication_exporter::domain::{
    BlobKeyRef, EpaAccount, EventKvnr, EventState, HashedKvnr, Kvnr, LookupCode, PrescriptionId,
    PrescriptionType, TaskEvent, UseCase,
};
use medication_exporter::tee3::{
    ChannelSettings, FixedResolver, InnerRequest, InnerResponse, LoopbackTransportFactory,
    PoolRegistry, RegistrySettings, Responder, StaticSigner,
};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::json;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

pub const HOST: &str = "epa.integration";
pub const KVNR: &str = "X123456789";
const MASTER_KEY: [u8; 32] = [7u8; 32];

pub fn endpoints(count: u16) -> Vec<SocketAddr> {
    (1..=count)
        .map(|i| SocketAddr::from(([10, 0, 0, i as u8], 443)))
        .collect()
}

/// Lookup answering every KVNR with the current code
pub struct SwitchableLookup {
    code: Mutex<LookupCode>,
}

impl SwitchableLookup {
    pub fn set(&self, code: LookupCode) {
        *self.code.lock() = code;
    }
}

#[async_trait]
impl AccountLookup for SwitchableLookup {
    async fn lookup(&self, _kvnr: &Kvnr) -> EpaAccount {
        let code = *self.code.lock();
        if code.reached_host() {
            EpaAccount::routed(code, HOST, 443)
        } else {
            EpaAccount::unrouted(code)
        }
    }
}

/// Inner statuses the responder hands out in order, 200 once exhausted
#[derive(Clone, Default)]
pub struct StatusScript(Arc<Mutex<VecDeque<u16>>>);

impl StatusScript {
    pub fn push(&self, statuses: &[u16]) {
        self.0.lock().extend(statuses.iter().copied());
    }

    fn next(&self) -> u16 {
        self.0.lock().pop_front().unwrap_or(200)
    }
}

pub struct Harness {
    pub store: Arc<MemoryExportStore>,
    pub responder: Arc<Responder>,
    pub registry: Arc<PoolRegistry>,
    pub lookup: Arc<SwitchableLookup>,
    pub statuses: StatusScript,
    pub processor: Arc<KvnrProcessor>,
    keys: HkdfKeyDerivation,
}

pub struct HarnessOptions {
    pub max_retries: i32,
    pub endpoints: u16,
    pub channels: usize,
    pub sticky: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            endpoints: 1,
            channels: 2,
            sticky: true,
        }
    }
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_options(HarnessOptions::default()).await
    }

    pub async fn with_options(options: HarnessOptions) -> Self {
        let statuses = StatusScript::default();
        let script = statuses.clone();
        let responder = Responder::with_handler(Arc::new(move |_: &InnerRequest| {
            let status = StatusCode::from_u16(script.next()).unwrap();
            InnerResponse::json(status, &json!({}))
        }));

        let registry = Arc::new(PoolRegistry::new(
            Arc::new(LoopbackTransportFactory::new(responder.clone())),
            Arc::new(StaticSigner),
            Arc::new(FixedResolver(endpoints(options.endpoints))),
            ChannelSettings {
                user_agent: "exporter-integration".to_string(),
                session_lifetime: Duration::from_secs(600),
                production: false,
            },
            RegistrySettings {
                endpoint_retry_timeout: Duration::from_secs(3),
                endpoint_max_retry_timeout: Duration::from_secs(300),
                dns_refresh_interval: Duration::from_secs(3600),
                resolve_retry: Duration::from_millis(5),
            },
        ));
        registry
            .add_host(HOST, 443, options.channels)
            .await
            .unwrap();

        let store = Arc::new(MemoryExportStore::new());
        let lookup = Arc::new(SwitchableLookup {
            code: Mutex::new(LookupCode::Allowed),
        });
        let keys = Arc::new(master_keys());
        let codec = Arc::new(JsonPayloadCodec);
        let processor = Arc::new(KvnrProcessor::new(
            store.clone(),
            lookup.clone(),
            EventDecoder::new(keys, codec.clone()),
            EventDispatcher::new(codec, store.clone()),
            Arc::new(RegistryClientProvider::new(
                registry.clone(),
                "exporter-integration",
                options.sticky,
            )),
            ProcessorSettings {
                max_retries: options.max_retries,
                retry_delay: Duration::from_secs(60),
                conflict_wait: Duration::from_secs(24 * 3600),
            },
        ));

        Self {
            store,
            responder,
            registry,
            lookup,
            statuses,
            processor,
            keys: master_keys(),
        }
    }

    pub fn hashed(&self) -> HashedKvnr {
        hashed_kvnr(KVNR)
    }

    /// Stores an event for [`KVNR`] with all material its use case needs
    pub async fn add_event(&self, use_case: UseCase, prescription: &str) -> i64 {
        self.add_event_for(KVNR, use_case, prescription).await
    }

    pub async fn add_event_for(&self, kvnr: &str, use_case: UseCase, prescription: &str) -> i64 {
        let task_key = BlobKeyRef {
            blob_id: 11,
            salt: vec![3u8; 16],
        };
        let dispense_key = BlobKeyRef {
            blob_id: 12,
            salt: vec![4u8; 16],
        };
        let task = self.keys.derive_key(KeyPurpose::Task, &task_key).await.unwrap();
        let dispense = self
            .keys
            .derive_key(KeyPurpose::MedicationDispense, &dispense_key)
            .await
            .unwrap();
        let seal = |key: &SymmetricKey, value: serde_json::Value| {
            encrypt_blob(key, value.to_string().as_bytes()).unwrap()
        };

        let mut event = TaskEvent {
            id: 0,
            prescription_id: PrescriptionId::new(prescription).unwrap(),
            prescription_type: PrescriptionType::ApothekenpflichtigeArzneimittel,
            kvnr_encrypted: encrypt_blob(&task, kvnr.as_bytes()).unwrap(),
            hashed_kvnr: hashed_kvnr(kvnr),
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
        };
        match use_case {
            UseCase::ProvidePrescription => {
                event.prescription_bundle = Some(seal(
                    &task,
                    json!({
                        "resourceType": "Bundle",
                        "entry": [
                            { "resource": { "resourceType": "MedicationRequest", "id": "mr" } },
                            { "resource": { "resourceType": "Medication", "id": "med" } },
                            { "resource": { "resourceType": "Practitioner", "id": "pr" } }
                        ]
                    }),
                ));
                event.doctor_identity = Some(seal(
                    &task,
                    json!({ "telematikId": "1-20012345", "name": "Praxis Dr. Test" }),
                ));
            }
            UseCase::ProvideDispensation => {
                event.medication_dispense_key = Some(dispense_key);
                event.medication_dispense_bundle = Some(seal(
                    &dispense,
                    json!({
                        "resourceType": "Bundle",
                        "entry": [
                            { "resource": { "resourceType": "MedicationDispense", "id": "md" } },
                            { "resource": { "resourceType": "Medication", "id": "med" } }
                        ]
                    }),
                ));
                event.pharmacy_identity = Some(seal(
                    &task,
                    json!({ "telematikId": "3-SMC-B-Testkarte", "name": "Adler Apotheke" }),
                ));
            }
            UseCase::CancelPrescription | UseCase::CancelDispensation => {}
        }
        self.store.insert_event(event).await
    }

    /// Claims the due KVNR the way a worker does
    pub async fn claim(&self) -> EventKvnr {
        // Rows become due strictly after their next_export
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.store
            .claim_next_kvnr()
            .await
            .unwrap()
            .expect("a due KVNR")
    }

    /// Makes a rescheduled KVNR due right away
    pub async fn make_due(&self) {
        self.store
            .set_next_export(&self.hashed(), Utc::now() - chrono::Duration::seconds(1))
            .await;
    }

    pub async fn kvnr_row(&self) -> EventKvnr {
        self.store.kvnr(&self.hashed()).await.unwrap()
    }

    pub async fn events(&self) -> Vec<TaskEvent> {
        self.store.events(&self.hashed()).await
    }

    /// Application requests the responder received, as operation paths
    pub fn delivered_paths(&self) -> Vec<String> {
        self.responder
            .received()
            .into_iter()
            .map(|r| r.request.path)
            .collect()
    }
}

fn master_keys() -> HkdfKeyDerivation {
    HkdfKeyDerivation::new(Zeroizing::new(MASTER_KEY.to_vec())).unwrap()
}

pub fn hashed_kvnr(kvnr: &str) -> HashedKvnr {
    use sha2::{Digest, Sha256};
    HashedKvnr::from_bytes(Sha256::digest(kvnr.as_bytes()).to_vec())
}
