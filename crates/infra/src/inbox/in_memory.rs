//! In-memory read side (inbox + projected rows) for tests/dev.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};

use orderflow_core::{EventId, OrderId};

use super::projection::{OrderReadModel, OrderReadStore, ProjectionEffect};
use super::store::{
    InboxEntryId, InboxError, InboxRecord, InboxStats, InboxStore, NewInboxRecord,
    ProcessingStatus, ReceiveOutcome, truncate_error,
};

#[derive(Debug, Default)]
struct Inner {
    inbox: HashMap<InboxEntryId, InboxRecord>,
    orders: HashMap<OrderId, OrderReadModel>,
}

/// In-memory inbox plus read model behind one lock, so a projection effect and
/// its PROCESSED transition commit together like they would in one database
/// transaction.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryReadSide {
    inner: RwLock<Inner>,
}

impl InMemoryReadSide {
    pub fn new() -> Self {
        Self::default()
    }

    fn write_lock(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, InboxError> {
        self.inner
            .write()
            .map_err(|_| InboxError::Storage("lock poisoned".to_string()))
    }

    fn read_lock(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, InboxError> {
        self.inner
            .read()
            .map_err(|_| InboxError::Storage("lock poisoned".to_string()))
    }

    fn sorted_oldest_first(mut records: Vec<InboxRecord>) -> Vec<InboxRecord> {
        records.sort_by_key(|r| (r.created_at, r.id.0));
        records
    }

    fn claim_is_free(record: &InboxRecord, now: DateTime<Utc>) -> bool {
        match record.claimed_until {
            None => true,
            Some(until) => until <= now,
        }
    }
}

impl InboxStore for InMemoryReadSide {
    fn record_received(
        &self,
        record: NewInboxRecord,
        now: DateTime<Utc>,
    ) -> Result<ReceiveOutcome, InboxError> {
        let mut inner = self.write_lock()?;

        if inner.inbox.values().any(|r| r.event_id == record.event_id) {
            return Ok(ReceiveOutcome::Duplicate);
        }

        let id = InboxEntryId::new();
        inner.inbox.insert(
            id,
            InboxRecord {
                id,
                event_id: record.event_id,
                message_id: record.message_id,
                event_type: record.event_type,
                status: ProcessingStatus::Deferred,
                target_entity_id: record.target_entity_id,
                depends_on_event_type: record.depends_on_event_type,
                attempts: 0,
                next_attempt_at: None,
                claimed_by: None,
                claimed_until: None,
                occurred_at: record.occurred_at,
                processed_at: None,
                created_at: now,
                error_message: None,
                payload: record.payload,
            },
        );

        Ok(ReceiveOutcome::Inserted)
    }

    fn claim_pending(
        &self,
        limit: usize,
        claimant: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<InboxRecord>, InboxError> {
        let mut inner = self.write_lock()?;

        let mut candidates: Vec<InboxEntryId> = inner
            .inbox
            .values()
            .filter(|r| {
                matches!(
                    r.status,
                    ProcessingStatus::Deferred | ProcessingStatus::Failed
                ) && r.next_attempt_at.is_none_or(|at| at <= now)
                    && Self::claim_is_free(r, now)
            })
            .map(|r| r.id)
            .collect();
        candidates.sort_by_key(|id| {
            let r = &inner.inbox[id];
            (r.created_at, r.id.0)
        });
        candidates.truncate(limit);

        let lease_until = now
            + chrono::Duration::from_std(lease)
                .map_err(|e| InboxError::Storage(format!("lease out of range: {e}")))?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some(r) = inner.inbox.get_mut(&id) {
                r.claimed_by = Some(claimant.to_string());
                r.claimed_until = Some(lease_until);
                claimed.push(r.clone());
            }
        }

        Ok(claimed)
    }

    fn commit_projection(
        &self,
        id: InboxEntryId,
        effect: ProjectionEffect,
        now: DateTime<Utc>,
    ) -> Result<(), InboxError> {
        let mut inner = self.write_lock()?;

        if !inner.inbox.contains_key(&id) {
            return Err(InboxError::NotFound(id));
        }

        match effect {
            ProjectionEffect::Upsert(row) => {
                inner.orders.insert(row.order_id, row);
            }
            ProjectionEffect::Remove(order_id) => {
                inner.orders.remove(&order_id);
            }
            ProjectionEffect::Noop => {}
        }

        // Same "transaction" as the effect above: one lock scope.
        let record = inner
            .inbox
            .get_mut(&id)
            .ok_or(InboxError::NotFound(id))?;
        record.status = ProcessingStatus::Processed;
        record.processed_at = Some(now);
        record.error_message = None;
        record.claimed_by = None;
        record.claimed_until = None;

        Ok(())
    }

    fn mark_failed(
        &self,
        id: InboxEntryId,
        error: &str,
        attempts: u32,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<(), InboxError> {
        let mut inner = self.write_lock()?;
        let record = inner.inbox.get_mut(&id).ok_or(InboxError::NotFound(id))?;

        record.status = ProcessingStatus::Failed;
        record.error_message = Some(truncate_error(error));
        record.attempts = attempts;
        record.next_attempt_at = next_attempt_at;
        record.claimed_by = None;
        record.claimed_until = None;

        Ok(())
    }

    fn mark_expired(&self, id: InboxEntryId, error: &str) -> Result<(), InboxError> {
        let mut inner = self.write_lock()?;
        let record = inner.inbox.get_mut(&id).ok_or(InboxError::NotFound(id))?;

        record.status = ProcessingStatus::Expired;
        record.error_message = Some(truncate_error(error));
        record.next_attempt_at = None;
        record.claimed_by = None;
        record.claimed_until = None;

        Ok(())
    }

    fn find(&self, event_id: EventId) -> Result<Option<InboxRecord>, InboxError> {
        let inner = self.read_lock()?;
        Ok(inner
            .inbox
            .values()
            .find(|r| r.event_id == event_id)
            .cloned())
    }

    fn list_by_status(&self, status: ProcessingStatus) -> Result<Vec<InboxRecord>, InboxError> {
        let inner = self.read_lock()?;
        Ok(Self::sorted_oldest_first(
            inner
                .inbox
                .values()
                .filter(|r| r.status == status)
                .cloned()
                .collect(),
        ))
    }

    fn list_pending(&self) -> Result<Vec<InboxRecord>, InboxError> {
        let inner = self.read_lock()?;
        Ok(Self::sorted_oldest_first(
            inner
                .inbox
                .values()
                .filter(|r| {
                    matches!(
                        r.status,
                        ProcessingStatus::Deferred
                            | ProcessingStatus::Failed
                            | ProcessingStatus::Expired
                    )
                })
                .cloned()
                .collect(),
        ))
    }

    fn list_by_type(&self, event_type: &str) -> Result<Vec<InboxRecord>, InboxError> {
        let inner = self.read_lock()?;
        Ok(Self::sorted_oldest_first(
            inner
                .inbox
                .values()
                .filter(|r| r.event_type.eq_ignore_ascii_case(event_type))
                .cloned()
                .collect(),
        ))
    }

    fn stats(&self) -> Result<InboxStats, InboxError> {
        let inner = self.read_lock()?;
        let mut processed = 0u64;
        let mut failed = 0u64;
        let mut deferred = 0u64;
        let mut expired = 0u64;

        for record in inner.inbox.values() {
            match record.status {
                ProcessingStatus::Processed => processed += 1,
                ProcessingStatus::Failed => failed += 1,
                ProcessingStatus::Deferred => deferred += 1,
                ProcessingStatus::Expired => expired += 1,
            }
        }

        Ok(InboxStats::compute(processed, failed, deferred, expired))
    }

    fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, InboxError> {
        let mut inner = self.write_lock()?;
        let before = inner.inbox.len();
        inner.inbox.retain(|_, r| {
            !(r.status == ProcessingStatus::Processed
                && r.processed_at.is_some_and(|at| at < older_than))
        });
        Ok(before - inner.inbox.len())
    }
}

impl OrderReadStore for InMemoryReadSide {
    fn get(&self, order_id: OrderId) -> Result<Option<OrderReadModel>, InboxError> {
        let inner = self.read_lock()?;
        Ok(inner.orders.get(&order_id).cloned())
    }

    fn list(&self) -> Result<Vec<OrderReadModel>, InboxError> {
        let inner = self.read_lock()?;
        let mut rows: Vec<OrderReadModel> = inner.orders.values().cloned().collect();
        rows.sort_by_key(|r| (r.created_at, *r.order_id.as_uuid()));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_record(event_id: EventId) -> NewInboxRecord {
        NewInboxRecord {
            event_id,
            message_id: None,
            event_type: "CREATE".to_string(),
            target_entity_id: Some(OrderId::new()),
            depends_on_event_type: None,
            occurred_at: Utc::now(),
            payload: json!({ "operation": "CREATE" }),
        }
    }

    #[test]
    fn redelivery_stores_exactly_one_record() {
        let store = InMemoryReadSide::new();
        let event_id = EventId::new();
        let now = Utc::now();

        assert_eq!(
            store.record_received(new_record(event_id), now).unwrap(),
            ReceiveOutcome::Inserted
        );
        for _ in 0..3 {
            assert_eq!(
                store.record_received(new_record(event_id), now).unwrap(),
                ReceiveOutcome::Duplicate
            );
        }

        assert_eq!(store.stats().unwrap().total, 1);
    }

    #[test]
    fn new_records_start_deferred_and_are_claimable() {
        let store = InMemoryReadSide::new();
        let now = Utc::now();
        store.record_received(new_record(EventId::new()), now).unwrap();

        let claimed = store
            .claim_pending(10, "proc-a", Duration::from_secs(60), now)
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, ProcessingStatus::Deferred);

        // Leased: another claimant gets nothing until expiry.
        let contested = store
            .claim_pending(10, "proc-b", Duration::from_secs(60), now)
            .unwrap();
        assert!(contested.is_empty());
    }

    #[test]
    fn commit_projection_is_atomic_with_processed_transition() {
        let store = InMemoryReadSide::new();
        let now = Utc::now();
        let event_id = EventId::new();
        let order_id = OrderId::new();

        let mut record = new_record(event_id);
        record.target_entity_id = Some(order_id);
        store.record_received(record, now).unwrap();

        let claimed = store
            .claim_pending(10, "proc", Duration::from_secs(0), now)
            .unwrap();
        store
            .commit_projection(
                claimed[0].id,
                ProjectionEffect::Upsert(OrderReadModel {
                    order_id,
                    customer_id: 7,
                    amount_cents: 1050,
                    status: "NEW".to_string(),
                    created_at: now,
                    last_modified_at: now,
                }),
                now,
            )
            .unwrap();

        assert!(store.get(order_id).unwrap().is_some());
        let stored = store.find(event_id).unwrap().unwrap();
        assert_eq!(stored.status, ProcessingStatus::Processed);
        assert_eq!(stored.processed_at, Some(now));

        // Terminal records are not claimable.
        let again = store
            .claim_pending(10, "proc", Duration::from_secs(0), now)
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn failed_records_wait_out_their_backoff() {
        let store = InMemoryReadSide::new();
        let now = Utc::now();
        store.record_received(new_record(EventId::new()), now).unwrap();

        let claimed = store
            .claim_pending(10, "proc", Duration::from_secs(0), now)
            .unwrap();
        let retry_at = now + chrono::Duration::seconds(30);
        store
            .mark_failed(claimed[0].id, "boom", 1, Some(retry_at))
            .unwrap();

        assert!(
            store
                .claim_pending(10, "proc", Duration::from_secs(0), now)
                .unwrap()
                .is_empty()
        );

        let ready = store
            .claim_pending(10, "proc", Duration::from_secs(0), retry_at)
            .unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].status, ProcessingStatus::Failed);
        assert_eq!(ready[0].attempts, 1);
    }

    #[test]
    fn expired_records_are_terminal_but_listed_pending() {
        let store = InMemoryReadSide::new();
        let now = Utc::now();
        let event_id = EventId::new();
        store.record_received(new_record(event_id), now).unwrap();

        let claimed = store
            .claim_pending(10, "proc", Duration::from_secs(0), now)
            .unwrap();
        store.mark_expired(claimed[0].id, "gave up").unwrap();

        assert!(
            store
                .claim_pending(10, "proc", Duration::from_secs(0), now)
                .unwrap()
                .is_empty()
        );
        let pending = store.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, ProcessingStatus::Expired);
    }

    #[test]
    fn list_by_type_is_case_insensitive() {
        let store = InMemoryReadSide::new();
        let now = Utc::now();
        store.record_received(new_record(EventId::new()), now).unwrap();

        assert_eq!(store.list_by_type("create").unwrap().len(), 1);
        assert_eq!(store.list_by_type("CREATE").unwrap().len(), 1);
        assert!(store.list_by_type("update").unwrap().is_empty());
    }

    #[test]
    fn cleanup_removes_only_old_processed_records() {
        let store = InMemoryReadSide::new();
        let now = Utc::now();
        let horizon = now - chrono::Duration::days(7);

        // Old processed: removed.
        let old_processed = EventId::new();
        store
            .record_received(new_record(old_processed), now - chrono::Duration::days(10))
            .unwrap();
        let claimed = store
            .claim_pending(10, "proc", Duration::from_secs(0), now)
            .unwrap();
        store
            .commit_projection(
                claimed[0].id,
                ProjectionEffect::Noop,
                now - chrono::Duration::days(8),
            )
            .unwrap();

        // Old but unprocessed: kept.
        let old_deferred = EventId::new();
        store
            .record_received(new_record(old_deferred), now - chrono::Duration::days(10))
            .unwrap();

        let removed = store.cleanup(horizon).unwrap();
        assert_eq!(removed, 1);
        assert!(store.find(old_processed).unwrap().is_none());
        assert!(store.find(old_deferred).unwrap().is_some());
    }
}
