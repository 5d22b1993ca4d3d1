//! Event store factory
//!
//! Builds the store and audit sink the export pipeline runs against.

use crate::adapters::database::memory::MemoryExportStore;
use crate::adapters::database::traits::{AuditSink, ExportStore};
use crate::adapters::postgresql::adapter::PostgreSQLAdapter;
use crate::adapters::postgresql::client::PostgreSQLClient;
use crate::config::schema::DatabaseConfig;
use crate::domain::Result;
use std::sync::Arc;

/// Store and audit sink sharing one backend
pub type StoreHandles = (
    Arc<dyn ExportStore + Send + Sync>,
    Arc<dyn AuditSink + Send + Sync>,
);

/// Create the PostgreSQL store and audit sink from one connection pool
///
/// Runs the schema migration first when `run_migrations` is set.
///
/// # Errors
///
/// Returns an error if the pool cannot be created or the migration fails
pub async fn create_store(config: &DatabaseConfig) -> Result<StoreHandles> {
    let client = PostgreSQLClient::new(config.clone()).await?;
    tracing::info!(
        database = %client.connection_string_safe(),
        max_connections = config.max_connections,
        "Creating PostgreSQL event store"
    );

    if config.run_migrations {
        client.run_migrations().await?;
    }

    let adapter = Arc::new(PostgreSQLAdapter::new(client));
    Ok((
        adapter.clone() as Arc<dyn ExportStore + Send + Sync>,
        adapter as Arc<dyn AuditSink + Send + Sync>,
    ))
}

/// Create an in-memory store and audit sink
pub fn create_memory_store() -> StoreHandles {
    tracing::warn!("Using the in-memory event store, nothing is persisted");
    let store = Arc::new(MemoryExportStore::new());
    (
        store.clone() as Arc<dyn ExportStore + Send + Sync>,
        store as Arc<dyn AuditSink + Send + Sync>,
    )
}
