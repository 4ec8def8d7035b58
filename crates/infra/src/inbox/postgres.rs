//! Postgres-backed read side (inbox + projected rows).
//!
//! The inbox (`inbox`) and the query model (`orders_read`) live in the same
//! database so `commit_projection` can apply the effect and the PROCESSED
//! transition in one transaction. `event_id` uniqueness is enforced by the
//! database; claims use `FOR UPDATE SKIP LOCKED` so concurrent processor
//! instances partition the backlog.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use orderflow_core::{EventId, MessageId, OrderId};

use super::projection::{OrderReadModel, OrderReadStore, ProjectionEffect};
use super::store::{
    InboxEntryId, InboxError, InboxRecord, InboxStats, InboxStore, NewInboxRecord,
    ProcessingStatus, ReceiveOutcome,
};

/// Postgres inbox + read model (`inbox` and `orders_read` in `migrations.sql`).
#[derive(Debug, Clone)]
pub struct PostgresReadSide {
    pool: Arc<PgPool>,
}

impl PostgresReadSide {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    #[instrument(skip(self, record), fields(event_id = %record.event_id), err)]
    pub async fn record_received_async(
        &self,
        record: NewInboxRecord,
        now: DateTime<Utc>,
    ) -> Result<ReceiveOutcome, InboxError> {
        let result = sqlx::query(
            r#"
            INSERT INTO inbox (id, event_id, message_id, event_type, status,
                               target_entity_id, depends_on_event_type, attempts,
                               occurred_at, created_at, payload)
            VALUES ($1, $2, $3, $4, 'DEFERRED', $5, $6, 0, $7, $8, $9)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(InboxEntryId::new().0)
        .bind(record.event_id.as_uuid())
        .bind(record.message_id.map(|m| *m.as_uuid()))
        .bind(&record.event_type)
        .bind(record.target_entity_id.map(|t| *t.as_uuid()))
        .bind(&record.depends_on_event_type)
        .bind(record.occurred_at)
        .bind(now)
        .bind(&record.payload)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("inbox record_received", e))?;

        if result.rows_affected() == 0 {
            Ok(ReceiveOutcome::Duplicate)
        } else {
            Ok(ReceiveOutcome::Inserted)
        }
    }

    #[instrument(skip(self), err)]
    pub async fn claim_pending_async(
        &self,
        limit: usize,
        claimant: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<InboxRecord>, InboxError> {
        let lease_until = now
            + chrono::Duration::from_std(lease)
                .map_err(|e| InboxError::Storage(format!("lease out of range: {e}")))?;

        let rows = sqlx::query(
            r#"
            UPDATE inbox
            SET claimed_by = $1, claimed_until = $2
            WHERE id IN (
                SELECT id FROM inbox
                WHERE status IN ('DEFERRED', 'FAILED')
                  AND (next_attempt_at IS NULL OR next_attempt_at <= $3)
                  AND (claimed_until IS NULL OR claimed_until <= $3)
                ORDER BY created_at ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, event_id, message_id, event_type, status,
                      target_entity_id, depends_on_event_type, attempts,
                      next_attempt_at, claimed_by, claimed_until, occurred_at,
                      processed_at, created_at, error_message, payload
            "#,
        )
        .bind(claimant)
        .bind(lease_until)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("inbox claim", e))?;

        let mut records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING order is unspecified; restore oldest-first.
        records.sort_by_key(|r| (r.created_at, r.id.0));
        Ok(records)
    }

    #[instrument(skip(self, effect), err)]
    pub async fn commit_projection_async(
        &self,
        id: InboxEntryId,
        effect: ProjectionEffect,
        now: DateTime<Utc>,
    ) -> Result<(), InboxError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("inbox commit begin", e))?;

        match effect {
            ProjectionEffect::Upsert(row) => {
                sqlx::query(
                    r#"
                    INSERT INTO orders_read (order_id, customer_id, amount_cents,
                                             status, created_at, last_modified_at)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (order_id) DO UPDATE
                    SET customer_id = EXCLUDED.customer_id,
                        amount_cents = EXCLUDED.amount_cents,
                        status = EXCLUDED.status,
                        last_modified_at = EXCLUDED.last_modified_at
                    "#,
                )
                .bind(row.order_id.as_uuid())
                .bind(row.customer_id)
                .bind(row.amount_cents)
                .bind(&row.status)
                .bind(row.created_at)
                .bind(row.last_modified_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("read model upsert", e))?;
            }
            ProjectionEffect::Remove(order_id) => {
                sqlx::query("DELETE FROM orders_read WHERE order_id = $1")
                    .bind(order_id.as_uuid())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("read model delete", e))?;
            }
            ProjectionEffect::Noop => {}
        }

        let result = sqlx::query(
            r#"
            UPDATE inbox
            SET status = 'PROCESSED', processed_at = $2, error_message = NULL,
                claimed_by = NULL, claimed_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("inbox mark processed", e))?;

        if result.rows_affected() == 0 {
            // Dropping the transaction rolls back the effect.
            return Err(InboxError::NotFound(id));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("inbox commit", e))
    }

    #[instrument(skip(self, error), err)]
    pub async fn mark_failed_async(
        &self,
        id: InboxEntryId,
        error: &str,
        attempts: u32,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<(), InboxError> {
        let result = sqlx::query(
            r#"
            UPDATE inbox
            SET status = 'FAILED', error_message = $2, attempts = $3,
                next_attempt_at = $4, claimed_by = NULL, claimed_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(super::store::truncate_error(error))
        .bind(attempts as i32)
        .bind(next_attempt_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("inbox mark_failed", e))?;

        if result.rows_affected() == 0 {
            return Err(InboxError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self, error), err)]
    pub async fn mark_expired_async(&self, id: InboxEntryId, error: &str) -> Result<(), InboxError> {
        let result = sqlx::query(
            r#"
            UPDATE inbox
            SET status = 'EXPIRED', error_message = $2, next_attempt_at = NULL,
                claimed_by = NULL, claimed_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(super::store::truncate_error(error))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("inbox mark_expired", e))?;

        if result.rows_affected() == 0 {
            return Err(InboxError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn find_async(&self, event_id: EventId) -> Result<Option<InboxRecord>, InboxError> {
        let row = sqlx::query(&select_records("WHERE event_id = $1"))
            .bind(event_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("inbox find", e))?;

        row.as_ref().map(record_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    pub async fn list_by_status_async(
        &self,
        status: ProcessingStatus,
    ) -> Result<Vec<InboxRecord>, InboxError> {
        let rows = sqlx::query(&select_records("WHERE status = $1 ORDER BY created_at ASC"))
            .bind(status.as_str())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("inbox list_by_status", e))?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn list_pending_async(&self) -> Result<Vec<InboxRecord>, InboxError> {
        let rows = sqlx::query(&select_records(
            "WHERE status IN ('DEFERRED', 'FAILED', 'EXPIRED') ORDER BY created_at ASC",
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("inbox list_pending", e))?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn list_by_type_async(&self, event_type: &str) -> Result<Vec<InboxRecord>, InboxError> {
        let rows = sqlx::query(&select_records(
            "WHERE LOWER(event_type) = LOWER($1) ORDER BY created_at ASC",
        ))
        .bind(event_type)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("inbox list_by_type", e))?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn stats_async(&self) -> Result<InboxStats, InboxError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM inbox GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("inbox stats", e))?;

        let mut processed = 0u64;
        let mut failed = 0u64;
        let mut deferred = 0u64;
        let mut expired = 0u64;

        for row in &rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| InboxError::Storage(format!("failed to read stats row: {e}")))?;
            let count: i64 = row
                .try_get("n")
                .map_err(|e| InboxError::Storage(format!("failed to read stats row: {e}")))?;

            match ProcessingStatus::parse(&status) {
                Some(ProcessingStatus::Processed) => processed = count as u64,
                Some(ProcessingStatus::Failed) => failed = count as u64,
                Some(ProcessingStatus::Deferred) => deferred = count as u64,
                Some(ProcessingStatus::Expired) => expired = count as u64,
                None => {
                    return Err(InboxError::Storage(format!(
                        "unknown inbox status in database: {status}"
                    )));
                }
            }
        }

        Ok(InboxStats::compute(processed, failed, deferred, expired))
    }

    #[instrument(skip(self), err)]
    pub async fn cleanup_async(&self, older_than: DateTime<Utc>) -> Result<usize, InboxError> {
        let result = sqlx::query(
            r#"
            DELETE FROM inbox
            WHERE status = 'PROCESSED' AND processed_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("inbox cleanup", e))?;

        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self), err)]
    pub async fn get_async(&self, order_id: OrderId) -> Result<Option<OrderReadModel>, InboxError> {
        let row = sqlx::query(
            r#"
            SELECT order_id, customer_id, amount_cents, status, created_at, last_modified_at
            FROM orders_read
            WHERE order_id = $1
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("read model get", e))?;

        row.as_ref().map(read_model_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    pub async fn list_models_async(&self) -> Result<Vec<OrderReadModel>, InboxError> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, customer_id, amount_cents, status, created_at, last_modified_at
            FROM orders_read
            ORDER BY created_at ASC, order_id ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("read model list", e))?;

        rows.iter().map(read_model_from_row).collect()
    }
}

fn select_records(tail: &str) -> String {
    format!(
        "SELECT id, event_id, message_id, event_type, status, target_entity_id, \
         depends_on_event_type, attempts, next_attempt_at, claimed_by, claimed_until, \
         occurred_at, processed_at, created_at, error_message, payload \
         FROM inbox {tail}"
    )
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<InboxRecord, InboxError> {
    let read = |e: sqlx::Error| InboxError::Storage(format!("failed to read inbox row: {e}"));

    let status: String = row.try_get("status").map_err(read)?;
    let status = ProcessingStatus::parse(&status)
        .ok_or_else(|| InboxError::Storage(format!("unknown inbox status in database: {status}")))?;
    let attempts: i32 = row.try_get("attempts").map_err(read)?;

    Ok(InboxRecord {
        id: InboxEntryId(row.try_get("id").map_err(read)?),
        event_id: EventId::from_uuid(row.try_get("event_id").map_err(read)?),
        message_id: row
            .try_get::<Option<uuid::Uuid>, _>("message_id")
            .map_err(read)?
            .map(MessageId::from_uuid),
        event_type: row.try_get("event_type").map_err(read)?,
        status,
        target_entity_id: row
            .try_get::<Option<uuid::Uuid>, _>("target_entity_id")
            .map_err(read)?
            .map(OrderId::from_uuid),
        depends_on_event_type: row.try_get("depends_on_event_type").map_err(read)?,
        attempts: attempts as u32,
        next_attempt_at: row.try_get("next_attempt_at").map_err(read)?,
        claimed_by: row.try_get("claimed_by").map_err(read)?,
        claimed_until: row.try_get("claimed_until").map_err(read)?,
        occurred_at: row.try_get("occurred_at").map_err(read)?,
        processed_at: row.try_get("processed_at").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
        error_message: row.try_get("error_message").map_err(read)?,
        payload: row.try_get("payload").map_err(read)?,
    })
}

fn read_model_from_row(row: &sqlx::postgres::PgRow) -> Result<OrderReadModel, InboxError> {
    let read = |e: sqlx::Error| InboxError::Storage(format!("failed to read order row: {e}"));

    Ok(OrderReadModel {
        order_id: OrderId::from_uuid(row.try_get("order_id").map_err(read)?),
        customer_id: row.try_get("customer_id").map_err(read)?,
        amount_cents: row.try_get("amount_cents").map_err(read)?,
        status: row.try_get("status").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
        last_modified_at: row.try_get("last_modified_at").map_err(read)?,
    })
}

/// Map SQLx errors to `InboxError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> InboxError {
    match err {
        sqlx::Error::Database(db_err) => InboxError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            InboxError::Storage(format!("connection pool closed in {operation}"))
        }
        other => InboxError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn runtime_handle() -> Result<tokio::runtime::Handle, InboxError> {
    tokio::runtime::Handle::try_current().map_err(|_| {
        InboxError::Storage("PostgresReadSide requires a tokio runtime context".to_string())
    })
}

// The store traits are synchronous; bridge via the ambient tokio runtime, as
// callers (listener and processor sweeps) run on plain threads inside it.
impl InboxStore for PostgresReadSide {
    fn record_received(
        &self,
        record: NewInboxRecord,
        now: DateTime<Utc>,
    ) -> Result<ReceiveOutcome, InboxError> {
        runtime_handle()?.block_on(self.record_received_async(record, now))
    }

    fn claim_pending(
        &self,
        limit: usize,
        claimant: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<InboxRecord>, InboxError> {
        runtime_handle()?.block_on(self.claim_pending_async(limit, claimant, lease, now))
    }

    fn commit_projection(
        &self,
        id: InboxEntryId,
        effect: ProjectionEffect,
        now: DateTime<Utc>,
    ) -> Result<(), InboxError> {
        runtime_handle()?.block_on(self.commit_projection_async(id, effect, now))
    }

    fn mark_failed(
        &self,
        id: InboxEntryId,
        error: &str,
        attempts: u32,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<(), InboxError> {
        runtime_handle()?.block_on(self.mark_failed_async(id, error, attempts, next_attempt_at))
    }

    fn mark_expired(&self, id: InboxEntryId, error: &str) -> Result<(), InboxError> {
        runtime_handle()?.block_on(self.mark_expired_async(id, error))
    }

    fn find(&self, event_id: EventId) -> Result<Option<InboxRecord>, InboxError> {
        runtime_handle()?.block_on(self.find_async(event_id))
    }

    fn list_by_status(&self, status: ProcessingStatus) -> Result<Vec<InboxRecord>, InboxError> {
        runtime_handle()?.block_on(self.list_by_status_async(status))
    }

    fn list_pending(&self) -> Result<Vec<InboxRecord>, InboxError> {
        runtime_handle()?.block_on(self.list_pending_async())
    }

    fn list_by_type(&self, event_type: &str) -> Result<Vec<InboxRecord>, InboxError> {
        runtime_handle()?.block_on(self.list_by_type_async(event_type))
    }

    fn stats(&self) -> Result<InboxStats, InboxError> {
        runtime_handle()?.block_on(self.stats_async())
    }

    fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, InboxError> {
        runtime_handle()?.block_on(self.cleanup_async(older_than))
    }
}

impl OrderReadStore for PostgresReadSide {
    fn get(&self, order_id: OrderId) -> Result<Option<OrderReadModel>, InboxError> {
        runtime_handle()?.block_on(self.get_async(order_id))
    }

    fn list(&self) -> Result<Vec<OrderReadModel>, InboxError> {
        runtime_handle()?.block_on(self.list_models_async())
    }
}
