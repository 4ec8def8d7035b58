//! Durable staging for not-yet-published events.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use orderflow_core::EventId;
use orderflow_orders::OrderEnvelope;

/// Unique outbox row identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboxEntryId(pub Uuid);

impl OutboxEntryId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for OutboxEntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OutboxEntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbox operation error.
#[derive(Debug, Clone, Error)]
pub enum OutboxError {
    #[error("outbox record not found: {0}")]
    NotFound(OutboxEntryId),
    #[error("payload serialization failed: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// An event staged for publication (not yet assigned a row identity).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboxRecord {
    pub event_id: EventId,
    pub event_type: String,
    pub payload: JsonValue,
    /// Logical route (e.g. exchange) to publish on.
    pub route: String,
    /// Destination channel (e.g. routing key).
    pub channel: String,
}

impl NewOutboxRecord {
    /// Stage a wire envelope, capturing its event identity and operation tag.
    pub fn from_envelope(
        envelope: &OrderEnvelope,
        route: impl Into<String>,
        channel: impl Into<String>,
    ) -> Result<Self, OutboxError> {
        let payload = serde_json::to_value(envelope)
            .map_err(|e| OutboxError::Serialization(e.to_string()))?;

        Ok(Self {
            event_id: envelope.event_id,
            event_type: envelope.payload.kind().as_str().to_string(),
            payload,
            route: route.into(),
            channel: channel.into(),
        })
    }
}

/// A stored outbox row.
///
/// `published` transitions only false -> true; rows leave the table only via
/// retention cleanup once published and older than the horizon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: OutboxEntryId,
    pub event_id: EventId,
    pub event_type: String,
    pub payload: JsonValue,
    pub route: String,
    pub channel: String,
    pub published: bool,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,
}

/// Outcome of an idempotent append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    /// A record with the same event identity already exists; nothing stored.
    Duplicate,
}

/// Durable outbox staging table.
///
/// `event_id` is globally unique within the store; appending a duplicate is a
/// no-op. On the write path the append is committed in the same transaction as
/// the command-ledger insert (see `WriteStore`), so a storage failure aborts
/// both.
///
/// Time is always passed in by the caller so components share one injected
/// clock.
pub trait OutboxStore: Send + Sync {
    /// Idempotent insert of an unpublished record.
    fn append(&self, record: NewOutboxRecord, now: DateTime<Utc>)
    -> Result<AppendOutcome, OutboxError>;

    /// Claim up to `limit` unpublished records, oldest-created-first.
    ///
    /// A claim is a lease: rows claimed by another instance are skipped until
    /// their lease expires, so horizontally-scaled publishers partition work
    /// instead of racing.
    fn claim_unpublished(
        &self,
        limit: usize,
        claimant: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, OutboxError>;

    /// Mark a record published. Separate transaction from `append`.
    fn mark_published(&self, id: OutboxEntryId, now: DateTime<Utc>) -> Result<(), OutboxError>;

    /// Record a publish failure and release the claim so the next sweep
    /// retries (at-least-once delivery).
    fn record_failure(&self, id: OutboxEntryId, error: &str) -> Result<(), OutboxError>;

    /// Delete published records with `published_at` older than the horizon.
    /// Returns how many rows were removed.
    fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, OutboxError>;

    /// Look up a record by event identity (monitoring/tests).
    fn find(&self, event_id: EventId) -> Result<Option<OutboxRecord>, OutboxError>;
}

impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    fn append(
        &self,
        record: NewOutboxRecord,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome, OutboxError> {
        (**self).append(record, now)
    }

    fn claim_unpublished(
        &self,
        limit: usize,
        claimant: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, OutboxError> {
        (**self).claim_unpublished(limit, claimant, lease, now)
    }

    fn mark_published(&self, id: OutboxEntryId, now: DateTime<Utc>) -> Result<(), OutboxError> {
        (**self).mark_published(id, now)
    }

    fn record_failure(&self, id: OutboxEntryId, error: &str) -> Result<(), OutboxError> {
        (**self).record_failure(id, error)
    }

    fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, OutboxError> {
        (**self).cleanup(older_than)
    }

    fn find(&self, event_id: EventId) -> Result<Option<OutboxRecord>, OutboxError> {
        (**self).find(event_id)
    }
}
