//! Inbox listener: the dedup-and-store fast path on the delivery thread.
//!
//! The listener never projects. It parses only the envelope header, stages the
//! raw payload in the inbox, and returns; the processor sweep does the decoding
//! and projection later. Keeping this path cheap means a burst of deliveries
//! cannot stall the channel consumer.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

use orderflow_core::Clock;
use orderflow_events::{ChannelMessage, EnvelopeHeader, IngressWorker, MessageChannel, WorkerHandle};
use orderflow_orders::OrderEventKind;

use super::store::{InboxError, InboxStore, NewInboxRecord, ReceiveOutcome};

/// Ingress failure: the message was not staged.
///
/// Unparsable bodies are rejected rather than staged, since without an event
/// identity there is nothing to deduplicate on.
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("failed to deserialize envelope: {0}")]
    Deserialization(String),
    #[error(transparent)]
    Store(#[from] InboxError),
}

/// Stages received envelopes in the inbox, deduplicating on event identity.
#[derive(Debug)]
pub struct InboxListener<S, C> {
    store: S,
    clock: C,
}

impl<S, C> InboxListener<S, C>
where
    S: InboxStore,
    C: Clock,
{
    pub fn new(store: S, clock: C) -> Self {
        Self { store, clock }
    }

    /// Handle one raw delivery: parse the header, stage the body.
    pub fn record_received(&self, body: &[u8]) -> Result<ReceiveOutcome, IngressError> {
        let header: EnvelopeHeader = serde_json::from_slice(body)
            .map_err(|e| IngressError::Deserialization(e.to_string()))?;
        let payload: JsonValue = serde_json::from_slice(body)
            .map_err(|e| IngressError::Deserialization(e.to_string()))?;

        // Everything except a CREATE presumes the lineage's CREATE has already
        // been projected; record that so operators can see why a record defers.
        let depends_on = match OrderEventKind::parse(&header.operation) {
            Some(OrderEventKind::Create) | None => None,
            Some(_) => Some(OrderEventKind::Create.as_str().to_string()),
        };

        let record = NewInboxRecord {
            event_id: header.event_id,
            message_id: Some(header.message_id),
            event_type: header.operation.clone(),
            target_entity_id: Some(header.entity_id),
            depends_on_event_type: depends_on,
            occurred_at: header.timestamp,
            payload,
        };

        let outcome = self.store.record_received(record, self.clock.now())?;
        match outcome {
            ReceiveOutcome::Inserted => {
                debug!(event_id = %header.event_id, operation = %header.operation, "staged inbound event");
            }
            ReceiveOutcome::Duplicate => {
                debug!(event_id = %header.event_id, "duplicate delivery ignored");
            }
        }
        Ok(outcome)
    }
}

impl<S, C> InboxListener<S, C>
where
    S: InboxStore + Send + Sync + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Subscribe to the channel and run this listener on the delivery thread.
    pub fn spawn<B>(self: Arc<Self>, channel: B) -> WorkerHandle
    where
        B: MessageChannel + Send + Sync + 'static,
    {
        IngressWorker::spawn("inbox-listener", channel, move |msg: ChannelMessage| {
            match self.record_received(&msg.body) {
                Ok(_) => Ok(()),
                Err(err @ IngressError::Deserialization(_)) => {
                    // Malformed bodies cannot be retried to success; log and drop.
                    warn!(route = %msg.route, error = %err, "dropping unparsable delivery");
                    Ok(())
                }
                Err(err) => Err(err),
            }
        })
    }
}
