//! Lineage fold: derive current order state from immutable command records.
//!
//! There is exactly one fold implementation. Plain reconstruction runs it with
//! no trace; audit replay runs the same fold with a [`TraceSink`] that records
//! every step. The two can never drift apart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use orderflow_core::{DomainError, DomainResult, OrderId};

use crate::command::{CommandRecord, CommandType};

/// Terminal status written by the DELETE fold step.
pub const CANCELLED_STATUS: &str = "CANCELLED";

/// Current state of one order, derived - never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderView {
    pub order_id: OrderId,
    pub customer_id: i64,
    /// Amount in smallest currency unit (cents).
    pub amount_cents: i64,
    pub status: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    pub deleted: bool,
}

/// One applied fold step, handed to a trace sink.
#[derive(Debug)]
pub struct FoldStep<'a> {
    /// Zero-based position in the lineage.
    pub index: usize,
    pub record: &'a CommandRecord,
    /// View state after applying the record.
    pub view: &'a OrderView,
}

/// Observer for audit/debug replay. See [`fold_lineage`].
pub trait TraceSink {
    fn step(&mut self, step: FoldStep<'_>);
}

/// Trace sink that logs each step through `tracing`.
#[derive(Debug, Default)]
pub struct LoggingTrace;

impl TraceSink for LoggingTrace {
    fn step(&mut self, step: FoldStep<'_>) {
        debug!(
            index = step.index,
            record_id = %step.record.id,
            command_type = %step.record.command_type,
            version = step.view.version,
            status = %step.view.status,
            deleted = step.view.deleted,
            "replay step"
        );
    }
}

/// Fold a lineage's records (creation order) into the current view.
///
/// Returns `Ok(None)` for an empty slice. The first record must be CREATE;
/// anything else means the stored history is corrupt and fails with an
/// integrity error scoped to this lineage only.
pub fn fold_lineage(
    records: &[CommandRecord],
    mut trace: Option<&mut dyn TraceSink>,
) -> DomainResult<Option<OrderView>> {
    let Some(first) = records.first() else {
        return Ok(None);
    };

    if first.command_type != CommandType::Create {
        return Err(DomainError::integrity(format!(
            "lineage {} starts with {} instead of CREATE",
            first.lineage_id(),
            first.command_type
        )));
    }

    let (Some(customer_id), Some(amount_cents), Some(status)) =
        (first.customer_id, first.amount_cents, first.status.clone())
    else {
        return Err(DomainError::integrity(format!(
            "CREATE record {} is missing required fields",
            first.id
        )));
    };

    let mut view = OrderView {
        order_id: first.lineage_id(),
        customer_id,
        amount_cents,
        status,
        version: first.version,
        created_at: first.created_at,
        last_modified_at: first.created_at,
        deleted: false,
    };

    if let Some(sink) = trace.as_deref_mut() {
        sink.step(FoldStep {
            index: 0,
            record: first,
            view: &view,
        });
    }

    for (index, record) in records.iter().enumerate().skip(1) {
        match record.command_type {
            CommandType::Create => {
                return Err(DomainError::integrity(format!(
                    "lineage {} contains a second CREATE record {}",
                    view.order_id, record.id
                )));
            }
            CommandType::Update => {
                if let Some(customer_id) = record.customer_id {
                    view.customer_id = customer_id;
                }
                if let Some(amount_cents) = record.amount_cents {
                    view.amount_cents = amount_cents;
                }
                if let Some(status) = record.status.clone() {
                    view.status = status;
                }
            }
            CommandType::Delete => {
                view.status = CANCELLED_STATUS.to_string();
                view.deleted = true;
            }
        }

        view.version = record.version;
        view.last_modified_at = record.created_at;

        if let Some(sink) = trace.as_deref_mut() {
            sink.step(FoldStep {
                index,
                record,
                view: &view,
            });
        }
    }

    Ok(Some(view))
}
