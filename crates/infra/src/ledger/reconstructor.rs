//! State reconstruction over the command ledger.

use thiserror::Error;

use orderflow_core::{DomainError, OrderId};
use orderflow_orders::{LoggingTrace, OrderView, TraceSink, fold_lineage};

use super::store::{CommandLedger, LedgerError};

/// Reconstruction failure: the ledger could not be read, or its contents are
/// not a valid lineage.
#[derive(Debug, Error)]
pub enum ReconstructError {
    #[error("order not found: {0}")]
    NotFound(OrderId),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Derives order state by folding ledger lineages.
///
/// Plain reconstruction and audit replay run the exact same fold; replay just
/// attaches a trace sink.
#[derive(Debug, Clone)]
pub struct OrderReconstructor<L> {
    ledger: L,
}

impl<L> OrderReconstructor<L>
where
    L: CommandLedger,
{
    pub fn new(ledger: L) -> Self {
        Self { ledger }
    }

    /// Fold the lineage into its current view. `None` for an unknown lineage.
    pub fn reconstruct(&self, order_id: OrderId) -> Result<Option<OrderView>, ReconstructError> {
        let records = self.ledger.load_lineage(order_id)?;
        Ok(fold_lineage(&records, None)?)
    }

    /// Like [`reconstruct`](Self::reconstruct), but an unknown lineage is an
    /// error. Note that a cancelled order still reconstructs (with
    /// `deleted = true`); history is never erased.
    pub fn current_state(&self, order_id: OrderId) -> Result<OrderView, ReconstructError> {
        self.reconstruct(order_id)?
            .ok_or(ReconstructError::NotFound(order_id))
    }

    pub fn latest_version(&self, order_id: OrderId) -> Result<Option<u64>, ReconstructError> {
        Ok(self.ledger.latest_version(order_id)?)
    }

    /// Audit replay: same fold, with every step handed to the sink.
    pub fn replay(
        &self,
        order_id: OrderId,
        sink: &mut dyn TraceSink,
    ) -> Result<Option<OrderView>, ReconstructError> {
        let records = self.ledger.load_lineage(order_id)?;
        Ok(fold_lineage(&records, Some(sink))?)
    }

    /// Replay with each step logged through `tracing`.
    pub fn replay_logged(&self, order_id: OrderId) -> Result<Option<OrderView>, ReconstructError> {
        self.replay(order_id, &mut LoggingTrace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::in_memory::InMemoryCommandLedger;
    use chrono::Utc;
    use orderflow_core::RecordId;
    use orderflow_orders::{CANCELLED_STATUS, CommandRecord, FoldStep, OrderPatch};
    use std::sync::Arc;

    fn seeded() -> (OrderReconstructor<Arc<InMemoryCommandLedger>>, OrderId) {
        let ledger = Arc::new(InMemoryCommandLedger::new());
        let root = RecordId::new();
        let create = CommandRecord::create(root, 7, 1050, "NEW", Utc::now());
        let lineage = create.lineage_id();
        ledger.append(&create).unwrap();
        ledger
            .append(
                &CommandRecord::update(
                    RecordId::new(),
                    root,
                    OrderPatch::new().status("SHIPPED"),
                    2,
                    Utc::now(),
                )
                .unwrap(),
            )
            .unwrap();

        (OrderReconstructor::new(ledger), lineage)
    }

    #[test]
    fn reconstructs_current_state() {
        let (reconstructor, order_id) = seeded();
        let view = reconstructor.current_state(order_id).unwrap();
        assert_eq!(view.status, "SHIPPED");
        assert_eq!(view.version, 2);
    }

    #[test]
    fn unknown_order_is_not_found() {
        let (reconstructor, _) = seeded();
        let err = reconstructor.current_state(OrderId::new()).unwrap_err();
        assert!(matches!(err, ReconstructError::NotFound(_)));
        assert!(reconstructor.reconstruct(OrderId::new()).unwrap().is_none());
    }

    #[test]
    fn cancelled_order_still_reconstructs() {
        let ledger = Arc::new(InMemoryCommandLedger::new());
        let root = RecordId::new();
        let create = CommandRecord::create(root, 7, 1050, "NEW", Utc::now());
        let lineage = create.lineage_id();
        ledger.append(&create).unwrap();
        ledger
            .append(&CommandRecord::delete(RecordId::new(), root, 2, Utc::now()))
            .unwrap();

        let view = OrderReconstructor::new(ledger)
            .current_state(lineage)
            .unwrap();
        assert!(view.deleted);
        assert_eq!(view.status, CANCELLED_STATUS);
    }

    #[test]
    fn replay_agrees_with_reconstruct() {
        struct Steps(usize);
        impl TraceSink for Steps {
            fn step(&mut self, _: FoldStep<'_>) {
                self.0 += 1;
            }
        }

        let (reconstructor, order_id) = seeded();
        let mut sink = Steps(0);
        let replayed = reconstructor.replay(order_id, &mut sink).unwrap();
        let plain = reconstructor.reconstruct(order_id).unwrap();

        assert_eq!(replayed, plain);
        assert_eq!(sink.0, 2);
    }
}
