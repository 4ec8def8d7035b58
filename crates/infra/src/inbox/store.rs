//! Durable staging for received-but-not-yet-projected events.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use orderflow_core::{EventId, MessageId, OrderId};

use super::projection::ProjectionEffect;

/// Stored error messages are truncated to this length.
pub const ERROR_MESSAGE_MAX: usize = 500;

/// Truncate an error message to the storable length (char boundary safe).
pub fn truncate_error(message: &str) -> String {
    if message.len() <= ERROR_MESSAGE_MAX {
        return message.to_string();
    }
    let mut end = ERROR_MESSAGE_MAX;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

/// Unique inbox row identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InboxEntryId(pub Uuid);

impl InboxEntryId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for InboxEntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InboxEntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Processing state machine of an inbox record.
///
/// DEFERRED is the initial state; FAILED records are retried with backoff;
/// PROCESSED and EXPIRED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingStatus {
    #[serde(rename = "PROCESSED")]
    Processed,
    #[serde(rename = "DEFERRED")]
    Deferred,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "EXPIRED")]
    Expired,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Processed => "PROCESSED",
            ProcessingStatus::Deferred => "DEFERRED",
            ProcessingStatus::Failed => "FAILED",
            ProcessingStatus::Expired => "EXPIRED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStatus::Processed | ProcessingStatus::Expired)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PROCESSED" => Some(Self::Processed),
            "DEFERRED" => Some(Self::Deferred),
            "FAILED" => Some(Self::Failed),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }
}

impl core::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbox operation error.
#[derive(Debug, Clone, Error)]
pub enum InboxError {
    #[error("inbox record not found: {0}")]
    NotFound(InboxEntryId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// A received event ready to be staged (not yet assigned a row identity).
#[derive(Debug, Clone)]
pub struct NewInboxRecord {
    pub event_id: EventId,
    pub message_id: Option<MessageId>,
    pub event_type: String,
    pub target_entity_id: Option<OrderId>,
    /// Event type this record logically depends on (UPDATE/DELETE depend on
    /// the lineage's CREATE having been projected).
    pub depends_on_event_type: Option<String>,
    /// When the change happened on the write side (envelope timestamp).
    pub occurred_at: DateTime<Utc>,
    /// Full wire envelope as received.
    pub payload: JsonValue,
}

/// A stored inbox row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxRecord {
    pub id: InboxEntryId,
    pub event_id: EventId,
    pub message_id: Option<MessageId>,
    pub event_type: String,
    pub status: ProcessingStatus,
    pub target_entity_id: Option<OrderId>,
    pub depends_on_event_type: Option<String>,
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,
    pub occurred_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub payload: JsonValue,
}

/// Outcome of the dedup-and-store ingress write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Inserted,
    /// Redelivery of an already-staged event; nothing stored.
    Duplicate,
}

/// Monitoring counters over the inbox (spec'd reporting contract).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InboxStats {
    pub total: u64,
    pub processed: u64,
    pub failed: u64,
    pub deferred: u64,
    pub expired: u64,
    /// failed + deferred + expired
    pub pending: u64,
    /// `processed / total` as a percentage string, `"N/A"` when total is 0.
    pub success_rate: String,
}

impl InboxStats {
    pub fn compute(processed: u64, failed: u64, deferred: u64, expired: u64) -> Self {
        let total = processed + failed + deferred + expired;
        let success_rate = if total == 0 {
            "N/A".to_string()
        } else {
            format!("{:.1}%", (processed as f64 / total as f64) * 100.0)
        };

        Self {
            total,
            processed,
            failed,
            deferred,
            expired,
            pending: failed + deferred + expired,
            success_rate,
        }
    }
}

/// Durable inbox staging table.
///
/// `event_id` uniqueness is the sole idempotency guard: a record is created
/// exactly once per distinct event identity no matter how many times the raw
/// message is redelivered, and the projection effect is applied at most once.
pub trait InboxStore: Send + Sync {
    /// Dedup-and-store ingress write. Fast path; never runs the projection.
    fn record_received(
        &self,
        record: NewInboxRecord,
        now: DateTime<Utc>,
    ) -> Result<ReceiveOutcome, InboxError>;

    /// Claim up to `limit` retryable records (DEFERRED or FAILED whose
    /// backoff has elapsed), oldest-created-first, under a lease.
    fn claim_pending(
        &self,
        limit: usize,
        claimant: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<InboxRecord>, InboxError>;

    /// Apply a projection effect and mark the record PROCESSED, atomically.
    fn commit_projection(
        &self,
        id: InboxEntryId,
        effect: ProjectionEffect,
        now: DateTime<Utc>,
    ) -> Result<(), InboxError>;

    /// Mark a record FAILED with a truncated error, bump its attempt count,
    /// schedule the next attempt, and release the claim.
    fn mark_failed(
        &self,
        id: InboxEntryId,
        error: &str,
        attempts: u32,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<(), InboxError>;

    /// Dead-letter: terminal EXPIRED transition once retries are exhausted.
    fn mark_expired(&self, id: InboxEntryId, error: &str) -> Result<(), InboxError>;

    /// Look up a record by event identity (monitoring/tests).
    fn find(&self, event_id: EventId) -> Result<Option<InboxRecord>, InboxError>;

    /// Records with the given status, oldest first.
    fn list_by_status(&self, status: ProcessingStatus) -> Result<Vec<InboxRecord>, InboxError>;

    /// DEFERRED ∪ FAILED ∪ EXPIRED, oldest first.
    fn list_pending(&self) -> Result<Vec<InboxRecord>, InboxError>;

    /// Case-insensitive event-type match, oldest first.
    fn list_by_type(&self, event_type: &str) -> Result<Vec<InboxRecord>, InboxError>;

    fn stats(&self) -> Result<InboxStats, InboxError>;

    /// Delete PROCESSED records older than the horizon. Returns the count.
    fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, InboxError>;
}

impl<S> InboxStore for Arc<S>
where
    S: InboxStore + ?Sized,
{
    fn record_received(
        &self,
        record: NewInboxRecord,
        now: DateTime<Utc>,
    ) -> Result<ReceiveOutcome, InboxError> {
        (**self).record_received(record, now)
    }

    fn claim_pending(
        &self,
        limit: usize,
        claimant: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<InboxRecord>, InboxError> {
        (**self).claim_pending(limit, claimant, lease, now)
    }

    fn commit_projection(
        &self,
        id: InboxEntryId,
        effect: ProjectionEffect,
        now: DateTime<Utc>,
    ) -> Result<(), InboxError> {
        (**self).commit_projection(id, effect, now)
    }

    fn mark_failed(
        &self,
        id: InboxEntryId,
        error: &str,
        attempts: u32,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<(), InboxError> {
        (**self).mark_failed(id, error, attempts, next_attempt_at)
    }

    fn mark_expired(&self, id: InboxEntryId, error: &str) -> Result<(), InboxError> {
        (**self).mark_expired(id, error)
    }

    fn find(&self, event_id: EventId) -> Result<Option<InboxRecord>, InboxError> {
        (**self).find(event_id)
    }

    fn list_by_status(&self, status: ProcessingStatus) -> Result<Vec<InboxRecord>, InboxError> {
        (**self).list_by_status(status)
    }

    fn list_pending(&self) -> Result<Vec<InboxRecord>, InboxError> {
        (**self).list_pending()
    }

    fn list_by_type(&self, event_type: &str) -> Result<Vec<InboxRecord>, InboxError> {
        (**self).list_by_type(event_type)
    }

    fn stats(&self) -> Result<InboxStats, InboxError> {
        (**self).stats()
    }

    fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, InboxError> {
        (**self).cleanup(older_than)
    }
}
