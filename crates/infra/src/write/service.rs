//! Write-side operations: validate, append to the ledger, stage the event.
//!
//! Every mutation follows the same shape: derive the lineage's current state,
//! apply the business checks, then commit the new command record and its wire
//! envelope atomically through the write store. A version conflict means a
//! concurrent writer got there first; the caller reloads and retries.

use tracing::info;

use orderflow_core::{Clock, EventId, MessageId, OrderId, RecordId};
use orderflow_orders::{CommandRecord, OrderPatch, OrderView, fold_lineage};

use super::store::{WriteError, WriteStore};
use crate::outbox::NewOutboxRecord;

/// Write-side configuration.
#[derive(Debug, Clone)]
pub struct WriteConfig {
    /// Logical route (e.g. exchange) staged envelopes are addressed to.
    pub route: String,
    /// Destination channel (e.g. routing key).
    pub channel: String,
    /// How many times a mutation retries after losing a version race.
    pub conflict_retries: u32,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            route: "orders".to_string(),
            channel: "orders.events".to_string(),
            conflict_retries: 3,
        }
    }
}

impl WriteConfig {
    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = route.into();
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }
}

/// Front door of the write side.
pub struct WriteSide<S, C> {
    store: S,
    clock: C,
    config: WriteConfig,
}

impl<S, C> WriteSide<S, C>
where
    S: WriteStore,
    C: Clock,
{
    pub fn new(store: S, clock: C, config: WriteConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Open a new order lineage.
    pub fn create_order(
        &self,
        customer_id: i64,
        amount_cents: i64,
        status: impl Into<String>,
    ) -> Result<OrderView, WriteError> {
        let status = status.into();
        validate_amount(amount_cents)?;
        validate_status(&status)?;

        let record = CommandRecord::create(
            RecordId::new(),
            customer_id,
            amount_cents,
            status,
            self.clock.now(),
        );
        self.commit(&record)?;

        info!(order_id = %record.lineage_id(), "order created");
        self.view_after(&record)
    }

    /// Amend an existing order. Fails for unknown or cancelled lineages.
    pub fn update_order(&self, order_id: OrderId, patch: OrderPatch) -> Result<OrderView, WriteError> {
        if let Some(amount) = patch.amount {
            validate_amount(amount)?;
        }
        if let Some(status) = &patch.status {
            validate_status(status)?;
        }

        self.retry_conflicts(|| {
            let (root, view) = self.live_lineage(order_id)?;
            let record = CommandRecord::update(
                RecordId::new(),
                root,
                patch.clone(),
                view.version + 1,
                self.clock.now(),
            )?;
            self.commit(&record)?;

            info!(%order_id, version = record.version, "order updated");
            self.view_after(&record)
        })
    }

    /// Close a lineage. The history stays; only the derived state flips to
    /// cancelled.
    pub fn cancel_order(&self, order_id: OrderId) -> Result<OrderView, WriteError> {
        self.retry_conflicts(|| {
            let (root, view) = self.live_lineage(order_id)?;
            let record =
                CommandRecord::delete(RecordId::new(), root, view.version + 1, self.clock.now());
            self.commit(&record)?;

            info!(%order_id, version = record.version, "order cancelled");
            self.view_after(&record)
        })
    }

    /// Current derived state of an order.
    pub fn current_state(&self, order_id: OrderId) -> Result<OrderView, WriteError> {
        let records = self.store.load_lineage(order_id)?;
        fold_lineage(&records, None)?.ok_or(WriteError::NotFound(order_id))
    }

    /// Load a lineage that exists and is not cancelled; returns its root
    /// record id and current view.
    fn live_lineage(&self, order_id: OrderId) -> Result<(RecordId, OrderView), WriteError> {
        let records = self.store.load_lineage(order_id)?;
        let view = fold_lineage(&records, None)?.ok_or(WriteError::NotFound(order_id))?;
        if view.deleted {
            return Err(WriteError::BusinessRule(format!(
                "order {order_id} is cancelled"
            )));
        }
        // fold_lineage guarantees the first record is the CREATE.
        let root = records[0].id;
        Ok((root, view))
    }

    fn commit(&self, record: &CommandRecord) -> Result<(), WriteError> {
        let envelope = record.to_envelope(EventId::new(), MessageId::new())?;
        let staged =
            NewOutboxRecord::from_envelope(&envelope, &self.config.route, &self.config.channel)?;
        self.store.commit(record, staged, self.clock.now())
    }

    fn view_after(&self, record: &CommandRecord) -> Result<OrderView, WriteError> {
        self.current_state(record.lineage_id())
    }

    /// Re-run a mutation after losing a version race; each run re-derives the
    /// version from the reloaded lineage.
    fn retry_conflicts<T>(
        &self,
        mut attempt: impl FnMut() -> Result<T, WriteError>,
    ) -> Result<T, WriteError> {
        let mut remaining = self.config.conflict_retries;
        loop {
            match attempt() {
                Err(WriteError::Conflict { lineage, version }) if remaining > 0 => {
                    remaining -= 1;
                    info!(%lineage, version, remaining, "version conflict; retrying");
                }
                other => return other,
            }
        }
    }
}

fn validate_amount(amount_cents: i64) -> Result<(), WriteError> {
    if amount_cents < 0 {
        return Err(WriteError::Validation(format!(
            "amount must not be negative, got {amount_cents}"
        )));
    }
    Ok(())
}

fn validate_status(status: &str) -> Result<(), WriteError> {
    if status.trim().is_empty() {
        return Err(WriteError::Validation(
            "status must not be blank".to_string(),
        ));
    }
    Ok(())
}
