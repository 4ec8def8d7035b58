//! Postgres-backed command ledger.
//!
//! The compare-and-swap append rides on the unique `(lineage_id, version)`
//! constraint: the losing writer of a version race gets a unique violation,
//! which maps to `LedgerError::Conflict`.

use std::sync::Arc;

use sqlx::{PgPool, Row};
use tracing::instrument;

use orderflow_core::{OrderId, RecordId};
use orderflow_orders::{CommandRecord, CommandType};

use super::store::{CommandLedger, LedgerError};

const UNIQUE_VIOLATION: &str = "23505";

/// Postgres ledger table (`command_ledger` in `migrations.sql`).
#[derive(Debug, Clone)]
pub struct PostgresCommandLedger {
    pool: Arc<PgPool>,
}

impl PostgresCommandLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub(crate) fn from_shared(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    #[instrument(skip(self, record), fields(record_id = %record.id, version = record.version), err)]
    pub async fn append_async(&self, record: &CommandRecord) -> Result<(), LedgerError> {
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
        .execute(&*self.pool)
        .await
        .map_err(|e| map_append_error(record, e))?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn load_lineage_async(
        &self,
        lineage: OrderId,
    ) -> Result<Vec<CommandRecord>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT id, command_type, origin, customer_id, amount_cents, status,
                   created_at, version
            FROM command_ledger
            WHERE lineage_id = $1
            ORDER BY version ASC
            "#,
        )
        .bind(lineage.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ledger load_lineage", e))?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn latest_version_async(&self, lineage: OrderId) -> Result<Option<u64>, LedgerError> {
        let row = sqlx::query(
            "SELECT MAX(version) AS latest FROM command_ledger WHERE lineage_id = $1",
        )
        .bind(lineage.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ledger latest_version", e))?;

        let latest: Option<i64> = row
            .try_get("latest")
            .map_err(|e| LedgerError::Storage(format!("failed to read ledger row: {e}")))?;
        Ok(latest.map(|v| v as u64))
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<CommandRecord, LedgerError> {
    let read = |e: sqlx::Error| LedgerError::Storage(format!("failed to read ledger row: {e}"));

    let command_type: String = row.try_get("command_type").map_err(read)?;
    let command_type = match command_type.as_str() {
        "CREATE" => CommandType::Create,
        "UPDATE" => CommandType::Update,
        "DELETE" => CommandType::Delete,
        other => {
            return Err(LedgerError::Storage(format!(
                "unknown command type in database: {other}"
            )));
        }
    };
    let version: i64 = row.try_get("version").map_err(read)?;

    Ok(CommandRecord {
        id: RecordId::from_uuid(row.try_get("id").map_err(read)?),
        command_type,
        origin: row
            .try_get::<Option<uuid::Uuid>, _>("origin")
            .map_err(read)?
            .map(RecordId::from_uuid),
        customer_id: row.try_get("customer_id").map_err(read)?,
        amount_cents: row.try_get("amount_cents").map_err(read)?,
        status: row.try_get("status").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
        version: version as u64,
    })
}

fn map_append_error(record: &CommandRecord, err: sqlx::Error) -> LedgerError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
            return LedgerError::Conflict {
                lineage: record.lineage_id(),
                version: record.version,
            };
        }
    }
    map_sqlx_error("ledger append", err)
}

/// Map SQLx errors to `LedgerError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => LedgerError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            LedgerError::Storage(format!("connection pool closed in {operation}"))
        }
        other => LedgerError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn runtime_handle() -> Result<tokio::runtime::Handle, LedgerError> {
    tokio::runtime::Handle::try_current().map_err(|_| {
        LedgerError::Storage("PostgresCommandLedger requires a tokio runtime context".to_string())
    })
}

impl CommandLedger for PostgresCommandLedger {
    fn append(&self, record: &CommandRecord) -> Result<(), LedgerError> {
        runtime_handle()?.block_on(self.append_async(record))
    }

    fn load_lineage(&self, lineage: OrderId) -> Result<Vec<CommandRecord>, LedgerError> {
        runtime_handle()?.block_on(self.load_lineage_async(lineage))
    }

    fn latest_version(&self, lineage: OrderId) -> Result<Option<u64>, LedgerError> {
        runtime_handle()?.block_on(self.latest_version_async(lineage))
    }
}
