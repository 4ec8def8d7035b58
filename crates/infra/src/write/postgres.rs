//! Postgres write store: ledger append + outbox staging in one transaction.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::instrument;

use orderflow_core::{EventId, OrderId};
use orderflow_orders::CommandRecord;

use super::store::{WriteError, WriteStore};
use crate::ledger::postgres::PostgresCommandLedger;
use crate::ledger::{CommandLedger, LedgerError};
use crate::outbox::postgres::PostgresOutboxStore;
use crate::outbox::{
    AppendOutcome, NewOutboxRecord, OutboxEntryId, OutboxError, OutboxRecord, OutboxStore,
};

const UNIQUE_VIOLATION: &str = "23505";

/// Ledger + outbox over one connection pool, so `commit` can span both tables
/// in a single transaction.
#[derive(Debug, Clone)]
pub struct PostgresWriteStore {
    pool: Arc<PgPool>,
    ledger: PostgresCommandLedger,
    outbox: PostgresOutboxStore,
}

impl PostgresWriteStore {
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);
        Self {
            ledger: PostgresCommandLedger::from_shared(Arc::clone(&pool)),
            outbox: PostgresOutboxStore::from_shared(Arc::clone(&pool)),
            pool,
        }
    }

    #[instrument(
        skip(self, record, staged),
        fields(record_id = %record.id, event_id = %staged.event_id),
        err
    )]
    pub async fn commit_async(
        &self,
        record: &CommandRecord,
        staged: NewOutboxRecord,
        now: DateTime<Utc>,
    ) -> Result<(), WriteError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| WriteError::Storage(format!("write commit begin: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO command_ledger (id, lineage_id, command_type, origin,
                                        customer_id, amount_cents, status,
                                        created_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.lineage_id().as_uuid())
        .bind(record.command_type.as_str())
        .bind(record.origin.map(|o| *o.as_uuid()))
        .bind(record.customer_id)
        .bind(record.amount_cents)
        .bind(&record.status)
        .bind(record.created_at)
        .bind(record.version as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_ledger_insert_error(record, e))?;

        // Idempotent: a retried commit with the same event id stages nothing new.
        sqlx::query(
            r#"
            INSERT INTO outbox (id, event_id, event_type, payload, route, channel, published, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(OutboxEntryId::new().0)
        .bind(staged.event_id.as_uuid())
        .bind(&staged.event_type)
        .bind(&staged.payload)
        .bind(&staged.route)
        .bind(&staged.channel)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| WriteError::Storage(format!("outbox stage in commit: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| WriteError::Storage(format!("write commit: {e}")))
    }
}

fn map_ledger_insert_error(record: &CommandRecord, err: sqlx::Error) -> WriteError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
            return WriteError::Conflict {
                lineage: record.lineage_id(),
                version: record.version,
            };
        }
    }
    WriteError::Storage(format!("ledger append in commit: {err}"))
}

fn runtime_handle() -> Result<tokio::runtime::Handle, WriteError> {
    tokio::runtime::Handle::try_current().map_err(|_| {
        WriteError::Storage("PostgresWriteStore requires a tokio runtime context".to_string())
    })
}

impl WriteStore for PostgresWriteStore {
    fn commit(
        &self,
        record: &CommandRecord,
        staged: NewOutboxRecord,
        now: DateTime<Utc>,
    ) -> Result<(), WriteError> {
        runtime_handle()?.block_on(self.commit_async(record, staged, now))
    }
}

impl CommandLedger for PostgresWriteStore {
    fn append(&self, record: &CommandRecord) -> Result<(), LedgerError> {
        self.ledger.append(record)
    }

    fn load_lineage(&self, lineage: OrderId) -> Result<Vec<CommandRecord>, LedgerError> {
        self.ledger.load_lineage(lineage)
    }

    fn latest_version(&self, lineage: OrderId) -> Result<Option<u64>, LedgerError> {
        self.ledger.latest_version(lineage)
    }
}

impl OutboxStore for PostgresWriteStore {
    fn append(
        &self,
        record: NewOutboxRecord,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome, OutboxError> {
        self.outbox.append(record, now)
    }

    fn claim_unpublished(
        &self,
        limit: usize,
        claimant: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, OutboxError> {
        self.outbox.claim_unpublished(limit, claimant, lease, now)
    }

    fn mark_published(&self, id: OutboxEntryId, now: DateTime<Utc>) -> Result<(), OutboxError> {
        self.outbox.mark_published(id, now)
    }

    fn record_failure(&self, id: OutboxEntryId, error: &str) -> Result<(), OutboxError> {
        self.outbox.record_failure(id, error)
    }

    fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, OutboxError> {
        self.outbox.cleanup(older_than)
    }

    fn find(&self, event_id: EventId) -> Result<Option<OutboxRecord>, OutboxError> {
        self.outbox.find(event_id)
    }
}
