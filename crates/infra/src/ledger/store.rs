//! Append-only command ledger: the write side's source of truth.

use std::sync::Arc;

use thiserror::Error;

use orderflow_core::OrderId;
use orderflow_orders::CommandRecord;

/// Ledger operation error.
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    /// Another writer appended this version first. The caller should reload
    /// the lineage and retry with the next version.
    #[error("version conflict on lineage {lineage}: version {version} already exists")]
    Conflict { lineage: OrderId, version: u64 },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Append-only store of immutable command records, grouped by lineage.
///
/// `append` is a compare-and-swap on `(lineage, version)`: it succeeds only if
/// no record with that version exists yet, which serializes concurrent writers
/// without any read-modify-write window.
pub trait CommandLedger: Send + Sync {
    fn append(&self, record: &CommandRecord) -> Result<(), LedgerError>;

    /// Full lineage history, oldest first (version order).
    fn load_lineage(&self, lineage: OrderId) -> Result<Vec<CommandRecord>, LedgerError>;

    /// Highest appended version, `None` for an unknown lineage.
    fn latest_version(&self, lineage: OrderId) -> Result<Option<u64>, LedgerError>;
}

impl<L> CommandLedger for Arc<L>
where
    L: CommandLedger + ?Sized,
{
    fn append(&self, record: &CommandRecord) -> Result<(), LedgerError> {
        (**self).append(record)
    }

    fn load_lineage(&self, lineage: OrderId) -> Result<Vec<CommandRecord>, LedgerError> {
        (**self).load_lineage(lineage)
    }

    fn latest_version(&self, lineage: OrderId) -> Result<Option<u64>, LedgerError> {
        (**self).latest_version(lineage)
    }
}
