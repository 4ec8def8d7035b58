//! In-memory outbox for tests/dev.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};

use orderflow_core::EventId;

use super::store::{
    AppendOutcome, NewOutboxRecord, OutboxEntryId, OutboxError, OutboxRecord, OutboxStore,
};

/// In-memory outbox staging table.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    records: RwLock<HashMap<OutboxEntryId, OutboxRecord>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove a record outright. Used by the in-memory write store to roll a
    /// failed atomic commit back; real backends use a transaction instead.
    pub(crate) fn remove(&self, id: OutboxEntryId) -> Result<(), OutboxError> {
        let mut records = self.write_lock()?;
        records.remove(&id);
        Ok(())
    }

    fn write_lock(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<OutboxEntryId, OutboxRecord>>, OutboxError>
    {
        self.records
            .write()
            .map_err(|_| OutboxError::Storage("lock poisoned".to_string()))
    }

    fn claim_is_free(record: &OutboxRecord, now: DateTime<Utc>) -> bool {
        match record.claimed_until {
            None => true,
            Some(until) => until <= now,
        }
    }
}

impl OutboxStore for InMemoryOutboxStore {
    fn append(
        &self,
        record: NewOutboxRecord,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome, OutboxError> {
        let mut records = self.write_lock()?;

        if records.values().any(|r| r.event_id == record.event_id) {
            return Ok(AppendOutcome::Duplicate);
        }

        let id = OutboxEntryId::new();
        records.insert(
            id,
            OutboxRecord {
                id,
                event_id: record.event_id,
                event_type: record.event_type,
                payload: record.payload,
                route: record.route,
                channel: record.channel,
                published: false,
                created_at: now,
                published_at: None,
                last_error: None,
                claimed_by: None,
                claimed_until: None,
            },
        );

        Ok(AppendOutcome::Inserted)
    }

    fn claim_unpublished(
        &self,
        limit: usize,
        claimant: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, OutboxError> {
        let mut records = self.write_lock()?;

        let mut candidates: Vec<OutboxEntryId> = records
            .values()
            .filter(|r| !r.published && Self::claim_is_free(r, now))
            .map(|r| r.id)
            .collect();
        candidates.sort_by_key(|id| {
            let r = &records[id];
            (r.created_at, r.id.0)
        });
        candidates.truncate(limit);

        let lease_until = now
            + chrono::Duration::from_std(lease)
                .map_err(|e| OutboxError::Storage(format!("lease out of range: {e}")))?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some(r) = records.get_mut(&id) {
                r.claimed_by = Some(claimant.to_string());
                r.claimed_until = Some(lease_until);
                claimed.push(r.clone());
            }
        }

        Ok(claimed)
    }

    fn mark_published(&self, id: OutboxEntryId, now: DateTime<Utc>) -> Result<(), OutboxError> {
        let mut records = self.write_lock()?;
        let record = records.get_mut(&id).ok_or(OutboxError::NotFound(id))?;

        record.published = true;
        record.published_at = Some(now);
        record.last_error = None;
        record.claimed_by = None;
        record.claimed_until = None;

        Ok(())
    }

    fn record_failure(&self, id: OutboxEntryId, error: &str) -> Result<(), OutboxError> {
        let mut records = self.write_lock()?;
        let record = records.get_mut(&id).ok_or(OutboxError::NotFound(id))?;

        record.last_error = Some(error.to_string());
        record.claimed_by = None;
        record.claimed_until = None;

        Ok(())
    }

    fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, OutboxError> {
        let mut records = self.write_lock()?;
        let before = records.len();
        records.retain(|_, r| !(r.published && r.published_at.is_some_and(|at| at < older_than)));
        Ok(before - records.len())
    }

    fn find(&self, event_id: EventId) -> Result<Option<OutboxRecord>, OutboxError> {
        let records = self
            .records
            .read()
            .map_err(|_| OutboxError::Storage("lock poisoned".to_string()))?;
        Ok(records.values().find(|r| r.event_id == event_id).cloned())
    }
}
