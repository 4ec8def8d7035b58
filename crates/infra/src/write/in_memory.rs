//! In-memory write store for tests/dev.

use chrono::{DateTime, Utc};
use std::time::Duration;

use orderflow_core::{EventId, OrderId};
use orderflow_orders::CommandRecord;

use super::store::{WriteError, WriteStore};
use crate::ledger::in_memory::InMemoryCommandLedger;
use crate::ledger::{CommandLedger, LedgerError};
use crate::outbox::in_memory::InMemoryOutboxStore;
use crate::outbox::{
    AppendOutcome, NewOutboxRecord, OutboxEntryId, OutboxError, OutboxRecord, OutboxStore,
};

/// Ledger + outbox backed by memory.
///
/// The atomic commit is emulated by rolling the ledger append back when the
/// outbox append fails; real backends use a database transaction.
#[derive(Debug, Default)]
pub struct InMemoryWriteStore {
    ledger: InMemoryCommandLedger,
    outbox: InMemoryOutboxStore,
}

impl InMemoryWriteStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WriteStore for InMemoryWriteStore {
    fn commit(
        &self,
        record: &CommandRecord,
        staged: NewOutboxRecord,
        now: DateTime<Utc>,
    ) -> Result<(), WriteError> {
        self.ledger.append(record)?;

        if let Err(err) = self.outbox.append(staged, now) {
            self.ledger.remove(record)?;
            return Err(err.into());
        }

        Ok(())
    }
}

impl CommandLedger for InMemoryWriteStore {
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

impl OutboxStore for InMemoryWriteStore {
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
