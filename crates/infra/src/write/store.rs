//! Atomic commit seam between the command ledger and the outbox.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use orderflow_core::{DomainError, OrderId};
use orderflow_orders::CommandRecord;

use crate::ledger::{CommandLedger, LedgerError};
use crate::outbox::{NewOutboxRecord, OutboxError, OutboxStore};

/// Write-side operation error.
#[derive(Debug, Error)]
pub enum WriteError {
    /// Concurrent writer won the version race; reload and retry.
    #[error("version conflict on order {lineage}: version {version} already exists")]
    Conflict { lineage: OrderId, version: u64 },
    #[error("order not found: {0}")]
    NotFound(OrderId),
    #[error("business rule violated: {0}")]
    BusinessRule(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("stored history is corrupt: {0}")]
    Integrity(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<LedgerError> for WriteError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Conflict { lineage, version } => WriteError::Conflict { lineage, version },
            LedgerError::Storage(msg) => WriteError::Storage(msg),
        }
    }
}

impl From<OutboxError> for WriteError {
    fn from(err: OutboxError) -> Self {
        WriteError::Storage(err.to_string())
    }
}

impl From<DomainError> for WriteError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                WriteError::Validation(msg)
            }
            DomainError::NotFound => WriteError::BusinessRule("not found".to_string()),
            DomainError::Conflict(msg) => WriteError::BusinessRule(msg),
            DomainError::IntegrityViolation(msg) => WriteError::Integrity(msg),
        }
    }
}

/// Ledger + outbox with an atomic commit across both.
///
/// `commit` appends the command record and stages its envelope so that either
/// both are durable or neither is; the outbox publisher then delivers the
/// envelope on its own schedule.
pub trait WriteStore: CommandLedger + OutboxStore {
    fn commit(
        &self,
        record: &CommandRecord,
        staged: NewOutboxRecord,
        now: DateTime<Utc>,
    ) -> Result<(), WriteError>;
}

impl<S> WriteStore for Arc<S>
where
    S: WriteStore + ?Sized,
{
    fn commit(
        &self,
        record: &CommandRecord,
        staged: NewOutboxRecord,
        now: DateTime<Utc>,
    ) -> Result<(), WriteError> {
        (**self).commit(record, staged, now)
    }
}
