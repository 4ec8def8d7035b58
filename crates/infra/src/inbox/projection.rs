//! Read-model projection of order events.
//!
//! The projection is computed as a pure decision (`project`) and applied by the
//! inbox store together with the PROCESSED status transition, in one
//! transaction, so a crash can never leave the effect applied but the record
//! unmarked (or vice versa).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use orderflow_core::OrderId;
use orderflow_orders::{OrderEvent, OrderPatch};

use super::store::InboxError;

/// One row of the read side's query model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReadModel {
    pub order_id: OrderId,
    pub customer_id: i64,
    /// Amount in smallest currency unit (cents).
    pub amount_cents: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

/// Read access to the projected rows.
///
/// The same backend implements this and `InboxStore` so the projection effect
/// and the status transition share a transaction.
pub trait OrderReadStore: Send + Sync {
    fn get(&self, order_id: OrderId) -> Result<Option<OrderReadModel>, InboxError>;

    fn list(&self) -> Result<Vec<OrderReadModel>, InboxError>;
}

impl<S> OrderReadStore for std::sync::Arc<S>
where
    S: OrderReadStore + ?Sized,
{
    fn get(&self, order_id: OrderId) -> Result<Option<OrderReadModel>, InboxError> {
        (**self).get(order_id)
    }

    fn list(&self) -> Result<Vec<OrderReadModel>, InboxError> {
        (**self).list()
    }
}

/// The write the projection decided on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectionEffect {
    Upsert(OrderReadModel),
    Remove(OrderId),
    /// Nothing to do (e.g. DELETE for a row that is already gone).
    Noop,
}

/// Deterministic business failure while projecting.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProjectionError {
    #[error("business rule violated: {0}")]
    BusinessRule(String),
}

/// Decide the read-model write for one event.
///
/// - CREATE inserts a fresh row;
/// - UPDATE overwrites only the fields present in the patch, and fails if the
///   target row does not exist;
/// - DELETE removes the row if present, otherwise logs and succeeds as a no-op.
pub fn project(
    order_id: OrderId,
    occurred_at: DateTime<Utc>,
    event: &OrderEvent,
    existing: Option<&OrderReadModel>,
) -> Result<ProjectionEffect, ProjectionError> {
    match event {
        OrderEvent::Created {
            customer_id,
            amount,
            status,
        } => Ok(ProjectionEffect::Upsert(OrderReadModel {
            order_id,
            customer_id: *customer_id,
            amount_cents: *amount,
            status: status.clone(),
            created_at: occurred_at,
            last_modified_at: occurred_at,
        })),

        OrderEvent::Updated(patch) => {
            let Some(current) = existing else {
                return Err(ProjectionError::BusinessRule(format!(
                    "update target order {order_id} does not exist"
                )));
            };
            Ok(ProjectionEffect::Upsert(apply_patch(
                current,
                patch,
                occurred_at,
            )))
        }

        OrderEvent::Deleted => {
            if existing.is_some() {
                Ok(ProjectionEffect::Remove(order_id))
            } else {
                info!(%order_id, "delete for unknown order; treating as no-op");
                Ok(ProjectionEffect::Noop)
            }
        }
    }
}

fn apply_patch(
    current: &OrderReadModel,
    patch: &OrderPatch,
    occurred_at: DateTime<Utc>,
) -> OrderReadModel {
    OrderReadModel {
        order_id: current.order_id,
        customer_id: patch.customer_id.unwrap_or(current.customer_id),
        amount_cents: patch.amount.unwrap_or(current.amount_cents),
        status: patch.status.clone().unwrap_or_else(|| current.status.clone()),
        created_at: current.created_at,
        last_modified_at: occurred_at,
    }
}
