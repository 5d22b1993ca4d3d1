//! PostgreSQL adapter implementing the event store traits

use crate::adapters::database::traits::{AuditSink, ExportStore, PROCESSING_LEASE};
use crate::adapters::postgresql::client::PostgreSQLClient;
use crate::adapters::postgresql::models::{
    kvnr_from_row, task_event_from_row, KVNR_COLUMNS, TASK_EVENT_COLUMNS,
};
use crate::domain::{
    AuditRecord, EventKvnr, HashedKvnr, PrescriptionId, PrescriptionType, Result, TaskEvent,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// PostgreSQL implementation of [`ExportStore`] and [`AuditSink`]
pub struct PostgreSQLAdapter {
    client: Arc<PostgreSQLClient>,
}

impl PostgreSQLAdapter {
    /// Create a new PostgreSQL adapter
    pub fn new(client: PostgreSQLClient) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    /// Get a reference to the underlying client
    pub fn client(&self) -> &Arc<PostgreSQLClient> {
        &self.client
    }
}

#[async_trait]
impl ExportStore for PostgreSQLAdapter {
    async fn claim_next_kvnr(&self) -> Result<Option<EventKvnr>> {
        let query = format!(
            "UPDATE erp_event.kvnr
             SET state = 'processing',
                 next_export = NOW() + ($1::double precision * INTERVAL '1 second')
             WHERE kvnr_hashed = (
                 SELECT kvnr_hashed FROM erp_event.kvnr
                 WHERE next_export < NOW() AND state IN ('processing', 'pending')
                 ORDER BY next_export
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {KVNR_COLUMNS}"
        );
        let lease = PROCESSING_LEASE.as_secs_f64();

        let row = self.client.query_opt(&query, &[&lease]).await?;
        row.as_ref().map(kvnr_from_row).transpose()
    }

    async fn pending_events(&self, kvnr: &HashedKvnr) -> Result<Vec<TaskEvent>> {
        let query = format!(
            "SELECT {TASK_EVENT_COLUMNS} FROM erp_event.task_event
             WHERE kvnr_hashed = $1 AND state = 'pending'
             ORDER BY prescription_id, last_modified, id"
        );
        let rows = self.client.query(&query, &[&kvnr.as_bytes()]).await?;
        rows.iter().map(task_event_from_row).collect()
    }

    async fn is_dead_letter(
        &self,
        kvnr: &HashedKvnr,
        prescription_id: &PrescriptionId,
        prescription_type: PrescriptionType,
    ) -> Result<bool> {
        let rows = self
            .client
            .query(
                "SELECT EXISTS (
                     SELECT 1 FROM erp_event.task_event
                     WHERE kvnr_hashed = $1 AND prescription_id = $2
                       AND prescription_type = $3 AND state = 'deadLetterQueue'
                 )",
                &[
                    &kvnr.as_bytes(),
                    &prescription_id.as_str(),
                    &prescription_type.code(),
                ],
            )
            .await?;
        Ok(rows.first().map(|row| row.get::<_, bool>(0)).unwrap_or(false))
    }

    async fn mark_dead_letter(
        &self,
        kvnr: &HashedKvnr,
        prescription_id: &PrescriptionId,
        prescription_type: PrescriptionType,
    ) -> Result<u64> {
        self.client
            .execute(
                "UPDATE erp_event.task_event SET state = 'deadLetterQueue'
                 WHERE kvnr_hashed = $1 AND prescription_id = $2 AND prescription_type = $3
                   AND state <> 'deadLetterQueue'",
                &[
                    &kvnr.as_bytes(),
                    &prescription_id.as_str(),
                    &prescription_type.code(),
                ],
            )
            .await
    }

    async fn mark_first_event_dead_letter(&self, kvnr: &HashedKvnr) -> Result<Option<TaskEvent>> {
        let query = format!(
            "UPDATE erp_event.task_event SET state = 'deadLetterQueue'
             WHERE id = (
                 SELECT id FROM erp_event.task_event
                 WHERE kvnr_hashed = $1 AND state = 'pending'
                 ORDER BY prescription_id, last_modified, id
                 LIMIT 1
             )
             RETURNING {TASK_EVENT_COLUMNS}"
        );
        let row = self.client.query_opt(&query, &[&kvnr.as_bytes()]).await?;
        row.as_ref().map(task_event_from_row).transpose()
    }

    async fn delete_event(&self, kvnr: &HashedKvnr, event_id: i64) -> Result<()> {
        self.client
            .execute(
                "DELETE FROM erp_event.task_event WHERE id = $1 AND kvnr_hashed = $2",
                &[&event_id, &kvnr.as_bytes()],
            )
            .await?;
        Ok(())
    }

    async fn delete_all_events(&self, kvnr: &HashedKvnr) -> Result<u64> {
        self.client
            .execute(
                "DELETE FROM erp_event.task_event WHERE kvnr_hashed = $1",
                &[&kvnr.as_bytes()],
            )
            .await
    }

    async fn update_processing_delay(
        &self,
        kvnr: &HashedKvnr,
        retry_count: i32,
        delay: Duration,
    ) -> Result<()> {
        let delay_seconds = delay.as_secs_f64();
        self.client
            .execute(
                "UPDATE erp_event.kvnr
                 SET state = 'pending', retry_count = $2,
                     next_export = NOW() + ($3::double precision * INTERVAL '1 second')
                 WHERE kvnr_hashed = $1",
                &[&kvnr.as_bytes(), &retry_count, &delay_seconds],
            )
            .await?;
        Ok(())
    }

    async fn finalize_kvnr(&self, kvnr: &HashedKvnr) -> Result<()> {
        self.client
            .execute(
                "UPDATE erp_event.kvnr
                 SET state = 'processed', retry_count = 0, next_export = NULL
                 WHERE kvnr_hashed = $1 AND state = 'processing'",
                &[&kvnr.as_bytes()],
            )
            .await?;
        Ok(())
    }

    async fn record_consent_check(&self, kvnr: &HashedKvnr, assigned_epa: &str) -> Result<()> {
        self.client
            .execute(
                "UPDATE erp_event.kvnr SET last_consent_check = NOW(), assigned_epa = $2
                 WHERE kvnr_hashed = $1",
                &[&kvnr.as_bytes(), &assigned_epa],
            )
            .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        self.client.test_connection().await
    }
}

#[async_trait]
impl AuditSink for PostgreSQLAdapter {
    async fn append(&self, record: AuditRecord) -> Result<()> {
        let action = serde_json::to_value(record.action)?;
        self.client
            .execute(
                "INSERT INTO erp_event.audit_event
                 (event_id, usecase, prescription_id, kvnr_hashed, outcome, http_status, action, recorded_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                &[
                    &record.event_id,
                    &record.use_case.as_str(),
                    &record.prescription_id.as_str(),
                    &record.hashed_kvnr.as_bytes(),
                    &record.outcome.to_string(),
                    &record.http_status.map(i32::from),
                    &action.as_str().unwrap_or_default(),
                    &record.recorded_at,
                ],
            )
            .await?;
        Ok(())
    }
}
