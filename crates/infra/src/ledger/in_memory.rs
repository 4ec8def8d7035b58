//! In-memory command ledger for tests/dev.

use std::collections::HashMap;
use std::sync::RwLock;

use orderflow_core::OrderId;
use orderflow_orders::CommandRecord;

use super::store::{CommandLedger, LedgerError};

/// In-memory ledger keyed by lineage. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryCommandLedger {
    lineages: RwLock<HashMap<OrderId, Vec<CommandRecord>>>,
}

impl InMemoryCommandLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Undo an append that was part of a failed multi-store commit.
    pub(crate) fn remove(&self, record: &CommandRecord) -> Result<(), LedgerError> {
        let mut lineages = self
            .lineages
            .write()
            .map_err(|_| LedgerError::Storage("lock poisoned".to_string()))?;
        if let Some(records) = lineages.get_mut(&record.lineage_id()) {
            records.retain(|r| r.id != record.id);
            if records.is_empty() {
                lineages.remove(&record.lineage_id());
            }
        }
        Ok(())
    }
}

impl CommandLedger for InMemoryCommandLedger {
    fn append(&self, record: &CommandRecord) -> Result<(), LedgerError> {
        let mut lineages = self
            .lineages
            .write()
            .map_err(|_| LedgerError::Storage("lock poisoned".to_string()))?;

        let lineage = record.lineage_id();
        let records = lineages.entry(lineage).or_default();

        if records.iter().any(|r| r.version == record.version) {
            return Err(LedgerError::Conflict {
                lineage,
                version: record.version,
            });
        }

        records.push(record.clone());
        records.sort_by_key(|r| r.version);
        Ok(())
    }

    fn load_lineage(&self, lineage: OrderId) -> Result<Vec<CommandRecord>, LedgerError> {
        let lineages = self
            .lineages
            .read()
            .map_err(|_| LedgerError::Storage("lock poisoned".to_string()))?;
        Ok(lineages.get(&lineage).cloned().unwrap_or_default())
    }

    fn latest_version(&self, lineage: OrderId) -> Result<Option<u64>, LedgerError> {
        let lineages = self
            .lineages
            .read()
            .map_err(|_| LedgerError::Storage("lock poisoned".to_string()))?;
        Ok(lineages
            .get(&lineage)
            .and_then(|records| records.iter().map(|r| r.version).max()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use orderflow_core::RecordId;
    use orderflow_orders::OrderPatch;

    #[test]
    fn append_and_load_preserve_version_order() {
        let ledger = InMemoryCommandLedger::new();
        let root = RecordId::new();
        let create = CommandRecord::create(root, 7, 1050, "NEW", Utc::now());
        let update = CommandRecord::update(
            RecordId::new(),
            root,
            OrderPatch::new().amount(2000),
            2,
            Utc::now(),
        )
        .unwrap();

        // Deliberately appended out of order.
        ledger.append(&create).unwrap();
        let delete = CommandRecord::delete(RecordId::new(), root, 3, Utc::now());
        ledger.append(&delete).unwrap();
        ledger.append(&update).unwrap();

        let lineage = ledger.load_lineage(create.lineage_id()).unwrap();
        let versions: Vec<u64> = lineage.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(ledger.latest_version(create.lineage_id()).unwrap(), Some(3));
    }

    #[test]
    fn duplicate_version_append_conflicts() {
        let ledger = InMemoryCommandLedger::new();
        let root = RecordId::new();
        ledger
            .append(&CommandRecord::create(root, 7, 1050, "NEW", Utc::now()))
            .unwrap();

        // Two writers race to append version 2; the loser gets a conflict.
        let a = CommandRecord::update(
            RecordId::new(),
            root,
            OrderPatch::new().amount(2000),
            2,
            Utc::now(),
        )
        .unwrap();
        let b = CommandRecord::update(
            RecordId::new(),
            root,
            OrderPatch::new().status("SHIPPED"),
            2,
            Utc::now(),
        )
        .unwrap();

        ledger.append(&a).unwrap();
        let err = ledger.append(&b).unwrap_err();
        assert!(matches!(err, LedgerError::Conflict { version: 2, .. }));
    }

    #[test]
    fn unknown_lineage_is_empty() {
        let ledger = InMemoryCommandLedger::new();
        let lineage = OrderId::new();
        assert!(ledger.load_lineage(lineage).unwrap().is_empty());
        assert_eq!(ledger.latest_version(lineage).unwrap(), None);
    }
}
