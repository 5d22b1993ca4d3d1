//! Event store abstraction
//!
//! The [`ExportStore`] trait with its in-memory implementation, and the
//! factory that picks the backend.

pub mod factory;
pub mod memory;
pub mod traits;

pub use factory::{create_memory_store, create_store, StoreHandles};
pub use memory::MemoryExportStore;
pub use traits::{AuditSink, ExportStore, TracingAuditSink, PROCESSING_LEASE};
