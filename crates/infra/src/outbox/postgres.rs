//! Postgres-backed outbox store.
//!
//! Uniqueness of `event_id` is enforced by the database (unique constraint),
//! so the idempotent append is a single `INSERT .. ON CONFLICT DO NOTHING`.
//! Batch claims use `FOR UPDATE SKIP LOCKED` so concurrent publisher instances
//! partition the backlog instead of racing over it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use orderflow_core::EventId;

use super::store::{
    AppendOutcome, NewOutboxRecord, OutboxEntryId, OutboxError, OutboxRecord, OutboxStore,
};

/// Postgres outbox staging table (`outbox` in `migrations.sql`).
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub(crate) fn from_shared(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    #[instrument(skip(self, record), fields(event_id = %record.event_id), err)]
    pub async fn append_async(
        &self,
        record: NewOutboxRecord,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome, OutboxError> {
        let result = sqlx::query(
            r#"
            INSERT INTO outbox (id, event_id, event_type, payload, route, channel, published, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(OutboxEntryId::new().0)
        .bind(record.event_id.as_uuid())
        .bind(&record.event_type)
        .bind(&record.payload)
        .bind(&record.route)
        .bind(&record.channel)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("outbox append", e))?;

        if result.rows_affected() == 0 {
            Ok(AppendOutcome::Duplicate)
        } else {
            Ok(AppendOutcome::Inserted)
        }
    }

    #[instrument(skip(self), err)]
    pub async fn claim_unpublished_async(
        &self,
        limit: usize,
        claimant: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, OutboxError> {
        let lease_until = now
            + chrono::Duration::from_std(lease)
                .map_err(|e| OutboxError::Storage(format!("lease out of range: {e}")))?;

        let rows = sqlx::query(
            r#"
            UPDATE outbox
            SET claimed_by = $1, claimed_until = $2
            WHERE id IN (
                SELECT id FROM outbox
                WHERE published = FALSE
                  AND (claimed_until IS NULL OR claimed_until <= $3)
                ORDER BY created_at ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, event_id, event_type, payload, route, channel,
                      published, created_at, published_at, last_error,
                      claimed_by, claimed_until
            "#,
        )
        .bind(claimant)
        .bind(lease_until)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("outbox claim", e))?;

        let mut records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING order is unspecified; restore oldest-first.
        records.sort_by_key(|r| (r.created_at, r.id.0));
        Ok(records)
    }

    #[instrument(skip(self), err)]
    pub async fn mark_published_async(
        &self,
        id: OutboxEntryId,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET published = TRUE, published_at = $2, last_error = NULL,
                claimed_by = NULL, claimed_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("outbox mark_published", e))?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self, error), err)]
    pub async fn record_failure_async(
        &self,
        id: OutboxEntryId,
        error: &str,
    ) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET last_error = $2, claimed_by = NULL, claimed_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("outbox record_failure", e))?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn cleanup_async(&self, older_than: DateTime<Utc>) -> Result<usize, OutboxError> {
        let result = sqlx::query(
            r#"
            DELETE FROM outbox
            WHERE published = TRUE AND published_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("outbox cleanup", e))?;

        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self), err)]
    pub async fn find_async(&self, event_id: EventId) -> Result<Option<OutboxRecord>, OutboxError> {
        let row = sqlx::query(
            r#"
            SELECT id, event_id, event_type, payload, route, channel,
                   published, created_at, published_at, last_error,
                   claimed_by, claimed_until
            FROM outbox
            WHERE event_id = $1
            "#,
        )
        .bind(event_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("outbox find", e))?;

        row.as_ref().map(record_from_row).transpose()
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<OutboxRecord, OutboxError> {
    let read = |e: sqlx::Error| OutboxError::Storage(format!("failed to read outbox row: {e}"));

    Ok(OutboxRecord {
        id: OutboxEntryId(row.try_get("id").map_err(read)?),
        event_id: EventId::from_uuid(row.try_get("event_id").map_err(read)?),
        event_type: row.try_get("event_type").map_err(read)?,
        payload: row.try_get("payload").map_err(read)?,
        route: row.try_get("route").map_err(read)?,
        channel: row.try_get("channel").map_err(read)?,
        published: row.try_get("published").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
        published_at: row.try_get("published_at").map_err(read)?,
        last_error: row.try_get("last_error").map_err(read)?,
        claimed_by: row.try_get("claimed_by").map_err(read)?,
        claimed_until: row.try_get("claimed_until").map_err(read)?,
    })
}

/// Map SQLx errors to `OutboxError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxError {
    match err {
        sqlx::Error::Database(db_err) => OutboxError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            OutboxError::Storage(format!("connection pool closed in {operation}"))
        }
        other => OutboxError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn runtime_handle() -> Result<tokio::runtime::Handle, OutboxError> {
    tokio::runtime::Handle::try_current().map_err(|_| {
        OutboxError::Storage(
            "PostgresOutboxStore requires a tokio runtime context".to_string(),
        )
    })
}

// The OutboxStore trait is synchronous; bridge via the ambient tokio runtime,
// as callers (publisher sweeps) run on plain threads inside the runtime.
impl OutboxStore for PostgresOutboxStore {
    fn append(
        &self,
        record: NewOutboxRecord,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome, OutboxError> {
        runtime_handle()?.block_on(self.append_async(record, now))
    }

    fn claim_unpublished(
        &self,
        limit: usize,
        claimant: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, OutboxError> {
        runtime_handle()?.block_on(self.claim_unpublished_async(limit, claimant, lease, now))
    }

    fn mark_published(&self, id: OutboxEntryId, now: DateTime<Utc>) -> Result<(), OutboxError> {
        runtime_handle()?.block_on(self.mark_published_async(id, now))
    }

    fn record_failure(&self, id: OutboxEntryId, error: &str) -> Result<(), OutboxError> {
        runtime_handle()?.block_on(self.record_failure_async(id, error))
    }

    fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, OutboxError> {
        runtime_handle()?.block_on(self.cleanup_async(older_than))
    }

    fn find(&self, event_id: EventId) -> Result<Option<OutboxRecord>, OutboxError> {
        runtime_handle()?.block_on(self.find_async(event_id))
    }
}
