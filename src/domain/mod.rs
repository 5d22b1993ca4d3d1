//! Domain models and types for the exporter.
//!
//! # Overview
//!
//! The domain layer provides:
//! - **Strongly-typed identifiers** ([`Kvnr`], [`HashedKvnr`], [`PrescriptionId`])
//! - **Stored rows** ([`EventKvnr`], [`TaskEvent`])
//! - **Decoded events** ([`ExportEvent`]), one variant per use case
//! - **Routing and outcomes** ([`EpaAccount`], [`DispatchOutcome`], [`AuditRecord`])
//! - **Error types** ([`ExporterError`], [`Tee3Error`]) and the [`Result`] alias
//!
//! # Type Safety
//!
//! The plaintext KVNR is personal data. [`Kvnr`] redacts itself in `Debug`
//! and `Display`, so it can sit in structs that get logged:
//!
//! ```rust
//! use medication_exporter::domain::Kvnr;
//!
//! let kvnr = Kvnr::new("X123456789").unwrap();
//! assert_eq!(format!("{kvnr:?}"), "Kvnr(X*********)");
//! ```

pub mod account;
pub mod errors;
pub mod event;
pub mod ids;
pub mod kvnr;
pub mod outcome;
pub mod result;
pub mod task_event;

// Re-export commonly used types for convenience
pub use account::{EpaAccount, LookupCode};
pub use errors::{ExporterError, Tee3Error};
pub use event::{EventCommon, ExportEvent, ProviderIdentity};
pub use ids::{HashedKvnr, Kvnr, PrescriptionId};
pub use kvnr::{EventKvnr, KvnrState};
pub use outcome::{AuditAction, AuditRecord, DispatchOutcome};
pub use result::Result;
pub use task_event::{BlobKeyRef, EventState, PrescriptionType, TaskEvent, UseCase};
