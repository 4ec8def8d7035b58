//! Immutable per-order command records.
//!
//! The command ledger is the write side's source of truth: one record per
//! CREATE/UPDATE/DELETE, never updated, never deleted. Current state is derived
//! by folding a lineage (see [`crate::view`]), not by mutating a row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orderflow_core::{DomainError, DomainResult, EventId, MessageId, OrderId, RecordId};
use orderflow_events::Envelope;

use crate::event::{OrderEvent, OrderEventKind, OrderPatch};

/// What a command record did to its lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandType {
    #[serde(rename = "CREATE")]
    Create,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Create => "CREATE",
            CommandType::Update => "UPDATE",
            CommandType::Delete => "DELETE",
        }
    }

    pub fn event_kind(&self) -> OrderEventKind {
        match self {
            CommandType::Create => OrderEventKind::Create,
            CommandType::Update => OrderEventKind::Update,
            CommandType::Delete => OrderEventKind::Delete,
        }
    }
}

impl core::fmt::Display for CommandType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable record in a lineage.
///
/// Field presence follows the command type: CREATE carries the full field set,
/// UPDATE carries only what it changes, DELETE carries nothing. `version` is
/// 1 for CREATE and increases by exactly 1 per subsequent record; the ledger
/// enforces this with a conditional insert (see `CommandLedger::append`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: RecordId,
    pub command_type: CommandType,
    /// The lineage's CREATE record id; `None` on the CREATE record itself.
    pub origin: Option<RecordId>,
    pub customer_id: Option<i64>,
    /// Amount in smallest currency unit (cents).
    pub amount_cents: Option<i64>,
    pub status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub version: u64,
}

impl CommandRecord {
    /// First record of a new lineage.
    pub fn create(
        id: RecordId,
        customer_id: i64,
        amount_cents: i64,
        status: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            command_type: CommandType::Create,
            origin: None,
            customer_id: Some(customer_id),
            amount_cents: Some(amount_cents),
            status: Some(status.into()),
            created_at,
            version: 1,
        }
    }

    /// Amendment record. Rejects an empty patch.
    pub fn update(
        id: RecordId,
        origin: RecordId,
        patch: OrderPatch,
        version: u64,
        created_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if patch.is_empty() {
            return Err(DomainError::validation(
                "update record must change at least one field",
            ));
        }
        Ok(Self {
            id,
            command_type: CommandType::Update,
            origin: Some(origin),
            customer_id: patch.customer_id,
            amount_cents: patch.amount,
            status: patch.status,
            created_at,
            version,
        })
    }

    /// Terminal record for a lineage.
    pub fn delete(
        id: RecordId,
        origin: RecordId,
        version: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            command_type: CommandType::Delete,
            origin: Some(origin),
            customer_id: None,
            amount_cents: None,
            status: None,
            created_at,
            version,
        }
    }

    /// The lineage this record belongs to (the CREATE record's id).
    pub fn lineage_id(&self) -> OrderId {
        OrderId::from(self.origin.unwrap_or(self.id))
    }

    pub fn patch(&self) -> OrderPatch {
        OrderPatch {
            customer_id: self.customer_id,
            amount: self.amount_cents,
            status: self.status.clone(),
        }
    }

    /// The domain event this record describes.
    ///
    /// Fails with an integrity error if a CREATE record is missing required
    /// fields - that can only happen to corrupted history.
    pub fn to_event(&self) -> DomainResult<OrderEvent> {
        match self.command_type {
            CommandType::Create => {
                let (Some(customer_id), Some(amount), Some(status)) =
                    (self.customer_id, self.amount_cents, self.status.clone())
                else {
                    return Err(DomainError::integrity(format!(
                        "CREATE record {} is missing required fields",
                        self.id
                    )));
                };
                Ok(OrderEvent::Created {
                    customer_id,
                    amount,
                    status,
                })
            }
            CommandType::Update => OrderEvent::updated(self.patch()),
            CommandType::Delete => Ok(OrderEvent::Deleted),
        }
    }

    /// Wire envelope for this record, addressed by the lineage root.
    pub fn to_envelope(
        &self,
        event_id: EventId,
        message_id: MessageId,
    ) -> DomainResult<Envelope<OrderEvent>> {
        Ok(Envelope::new(
            event_id,
            message_id,
            self.lineage_id(),
            self.created_at,
            self.to_event()?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created_at() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn create_record_starts_at_version_one() {
        let record = CommandRecord::create(RecordId::new(), 7, 1050, "NEW", created_at());
        assert_eq!(record.version, 1);
        assert!(record.origin.is_none());
        assert_eq!(record.lineage_id(), OrderId::from(*record.id.as_uuid()));
    }

    #[test]
    fn update_record_resolves_lineage_to_origin() {
        let root = RecordId::new();
        let record = CommandRecord::update(
            RecordId::new(),
            root,
            OrderPatch::new().amount(2000),
            2,
            created_at(),
        )
        .unwrap();

        assert_eq!(record.lineage_id(), OrderId::from(*root.as_uuid()));
        assert_eq!(record.amount_cents, Some(2000));
        assert!(record.customer_id.is_none());
    }

    #[test]
    fn empty_update_record_is_rejected() {
        let err = CommandRecord::update(
            RecordId::new(),
            RecordId::new(),
            OrderPatch::new(),
            2,
            created_at(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn envelope_operation_follows_command_type() {
        let root = RecordId::new();
        let record = CommandRecord::delete(RecordId::new(), root, 3, created_at());
        let envelope = record.to_envelope(EventId::new(), MessageId::new()).unwrap();

        assert_eq!(envelope.entity_id, OrderId::from(*root.as_uuid()));
        assert_eq!(envelope.payload, OrderEvent::Deleted);
    }

    #[test]
    fn corrupted_create_record_is_an_integrity_fault() {
        let mut record = CommandRecord::create(RecordId::new(), 7, 1050, "NEW", created_at());
        record.amount_cents = None;

        let err = record.to_event().unwrap_err();
        assert!(matches!(err, DomainError::IntegrityViolation(_)));
    }
}
