//! External system integrations.
//!
//! This module provides adapters for the systems around the export pipeline:
//!
//! - [`database`] - Event store abstraction (trait-based) and the in-memory store
//! - [`postgresql`] - PostgreSQL event store
//! - [`epa`] - ePA account lookup
//! - [`crypto`] - Blob keys, bearer token signing and certificate checks
//! - [`codec`] - FHIR payload decoding and encoding
//!
//! # Design Pattern
//!
//! Adapters follow the **Adapter Pattern** to isolate external dependencies and
//! enable testing with in-process implementations. Each seam is a trait:
//! [`database::ExportStore`], [`database::AuditSink`], [`epa::AccountLookup`],
//! [`crypto::KeyDerivation`], [`crypto::AuthorizationSigner`],
//! [`crypto::CertificateVerifier`] and [`codec::PayloadCodec`].
//!
//! # Event store
//!
//! ```rust
//! use medication_exporter::adapters::database::{create_memory_store, ExportStore};
//!
//! # async fn example() -> medication_exporter::domain::Result<()> {
//! let (store, _audit) = create_memory_store();
//! assert!(store.claim_next_kvnr().await?.is_none());
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod crypto;
pub mod database;
pub mod epa;
pub mod postgresql;
