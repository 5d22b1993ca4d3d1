//! PostgreSQL event store
//!
//! The `erp_event` schema holds one `kvnr` row per patient and the
//! `task_event` rows to export. [`PostgreSQLAdapter`] implements the claim
//! with `FOR UPDATE SKIP LOCKED`, so any number of exporter processes can
//! share one database.

pub mod adapter;
pub mod client;
pub mod models;

pub use adapter::PostgreSQLAdapter;
pub use client::PostgreSQLClient;
