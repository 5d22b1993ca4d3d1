//! Event export pipeline
//!
//! This module provides the per-KVNR export logic:
//! - Decoding stored rows into events ([`EventDecoder`])
//! - Delivery over TEE3 ([`TransportClient`]) and outcome classification ([`EventDispatcher`])
//! - The per-KVNR state machine ([`KvnrProcessor`]) and its retry backoff
//! - Pass summaries

pub mod backoff;
pub mod client;
pub mod decoder;
pub mod dispatcher;
pub mod processor;
pub mod summary;

pub use backoff::backoff;
pub use client::{ClientProvider, EpaResponse, EpaTransport, RegistryClientProvider, TransportClient};
pub use decoder::EventDecoder;
pub use dispatcher::{classify, EventDispatcher};
pub use processor::{KvnrProcessor, ProcessOutcome, ProcessorSettings};
pub use summary::{PassResult, PassSummary};
