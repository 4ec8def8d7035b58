use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orderflow_core::{EventId, MessageId, OrderId};

/// Wire envelope for a domain change, generic over the operation payload.
///
/// This is the unit the outbox publishes and the inbox receives.
///
/// Notes:
/// - `event_id` is the **idempotency key**: producers assign it once, and both
///   sides deduplicate on it no matter how often the channel redelivers.
/// - `message_id` identifies one delivery attempt; redeliveries carry fresh ones.
/// - The payload is flattened so the serialized form stays flat:
///   `{operation, entityId, ..., timestamp, eventId, messageId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<E> {
    pub event_id: EventId,
    pub message_id: MessageId,
    pub entity_id: OrderId,
    pub timestamp: DateTime<Utc>,

    #[serde(flatten)]
    pub payload: E,
}

impl<E> Envelope<E> {
    pub fn new(
        event_id: EventId,
        message_id: MessageId,
        entity_id: OrderId,
        timestamp: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            message_id,
            entity_id,
            timestamp,
            payload,
        }
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}

/// The envelope fields an ingress hook needs before it can deduplicate.
///
/// Deserializing only the header keeps the listener path cheap: the full payload
/// is decoded later, on the processor sweep, by the codec registry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeHeader {
    pub event_id: EventId,
    pub message_id: MessageId,
    pub entity_id: OrderId,
    pub timestamp: DateTime<Utc>,
    pub operation: String,
}
