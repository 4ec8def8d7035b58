//! Periodic inbox processor: decodes staged payloads and commits projections.
//!
//! Each sweep claims a batch of retryable records, decodes every payload
//! through the codec registry, computes the projection effect, and commits it
//! together with the PROCESSED transition. Failures bump the attempt counter
//! and reschedule with backoff; records that exhaust the ceiling are
//! dead-lettered as EXPIRED.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use orderflow_core::Clock;
use orderflow_events::WorkerHandle;
use orderflow_orders::{CodecError, CodecRegistry};

use super::projection::{OrderReadStore, ProjectionError, project};
use super::store::{InboxError, InboxRecord, InboxStore};
use crate::retry::RetryPolicy;
use crate::sweeper::{Sweeper, SweeperConfig};

/// Processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Name for logging/threads.
    pub name: String,
    /// Fixed delay between sweeps.
    pub poll_interval: Duration,
    /// Max records claimed per sweep.
    pub batch_size: usize,
    /// Claim owner recorded on leased rows (instance identity).
    pub claimant: String,
    /// Lease duration for claimed rows.
    pub lease: Duration,
    /// Backoff and attempt ceiling for failed records.
    pub retry: RetryPolicy,
    /// Processed records older than this are eligible for cleanup.
    pub retention: Duration,
    /// Fixed delay between retention sweeps.
    pub cleanup_interval: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            name: "inbox-processor".to_string(),
            poll_interval: Duration::from_secs(30),
            batch_size: 50,
            claimant: format!("inbox-processor/{}", uuid::Uuid::now_v7()),
            lease: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            retention: Duration::from_secs(7 * 24 * 3600),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

impl ProcessorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

/// Processor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ProcessorStats {
    pub sweeps: u64,
    pub processed: u64,
    pub failures: u64,
    pub expired: u64,
    pub cleaned_up: u64,
}

/// Drains retryable inbox records into the read model.
pub struct InboxProcessor<S, C> {
    store: S,
    clock: C,
    registry: CodecRegistry,
    config: ProcessorConfig,
    stats: Mutex<ProcessorStats>,
}

impl<S, C> InboxProcessor<S, C>
where
    S: InboxStore + OrderReadStore,
    C: Clock,
{
    /// Build a processor, checking at startup that the registry can decode
    /// every event kind the domain defines.
    pub fn new(
        store: S,
        clock: C,
        registry: CodecRegistry,
        config: ProcessorConfig,
    ) -> Result<Self, CodecError> {
        registry.validate_exhaustive()?;
        Ok(Self {
            store,
            clock,
            registry,
            config,
            stats: Mutex::new(ProcessorStats::default()),
        })
    }

    pub fn stats(&self) -> ProcessorStats {
        self.stats.lock().unwrap().clone()
    }

    /// One sweep: claim a batch and process each record independently. One
    /// record's failure never blocks the rest. Returns how many records
    /// reached PROCESSED.
    pub fn process_batch(&self) -> Result<usize, InboxError> {
        let now = self.clock.now();
        let batch = self.store.claim_pending(
            self.config.batch_size,
            &self.config.claimant,
            self.config.lease,
            now,
        )?;

        let mut processed = 0;
        for record in batch {
            if self.process_record(&record)? {
                processed += 1;
            }
        }

        let mut stats = self.stats.lock().unwrap();
        stats.sweeps += 1;
        stats.processed += processed as u64;

        Ok(processed)
    }

    fn process_record(&self, record: &InboxRecord) -> Result<bool, InboxError> {
        match self.try_project(record) {
            Ok(()) => {
                debug!(
                    processor = %self.config.name,
                    event_id = %record.event_id,
                    event_type = %record.event_type,
                    "processed inbox record"
                );
                Ok(true)
            }
            Err(reason) => {
                self.fail_or_expire(record, &reason)?;
                Ok(false)
            }
        }
    }

    /// Decode, project, and commit one record. Returns the failure reason as a
    /// string; the distinction that matters downstream is retry vs expire, and
    /// that is decided by the attempt counter, not the error class.
    fn try_project(&self, record: &InboxRecord) -> Result<(), String> {
        let event = self
            .registry
            .decode(&record.event_type, &record.payload)
            .map_err(|e| e.to_string())?;

        let order_id = record
            .target_entity_id
            .ok_or_else(|| "record has no target entity".to_string())?;

        let existing = self
            .store
            .get(order_id)
            .map_err(|e| format!("read model lookup failed: {e}"))?;

        let effect = project(order_id, record.occurred_at, &event, existing.as_ref())
            .map_err(|e: ProjectionError| e.to_string())?;

        self.store
            .commit_projection(record.id, effect, self.clock.now())
            .map_err(|e| format!("projection commit failed: {e}"))
    }

    fn fail_or_expire(&self, record: &InboxRecord, reason: &str) -> Result<(), InboxError> {
        let attempts = record.attempts + 1;

        if self.config.retry.should_retry(attempts) {
            let delay = self.config.retry.delay_for_attempt(attempts);
            let next_attempt_at = self.clock.now()
                + chrono::Duration::from_std(delay)
                    .map_err(|e| InboxError::Storage(format!("backoff out of range: {e}")))?;

            warn!(
                processor = %self.config.name,
                event_id = %record.event_id,
                attempts,
                reason,
                retry_at = %next_attempt_at,
                "inbox record failed; scheduled for retry"
            );
            self.store
                .mark_failed(record.id, reason, attempts, Some(next_attempt_at))?;
            self.stats.lock().unwrap().failures += 1;
        } else {
            warn!(
                processor = %self.config.name,
                event_id = %record.event_id,
                attempts,
                reason,
                "inbox record exhausted retries; dead-lettered"
            );
            self.store.mark_expired(record.id, reason)?;
            let mut stats = self.stats.lock().unwrap();
            stats.failures += 1;
            stats.expired += 1;
        }

        Ok(())
    }

    /// Retention sweep: drop processed rows older than the horizon.
    pub fn run_cleanup(&self) -> Result<usize, InboxError> {
        let horizon = self.clock.now()
            - chrono::Duration::from_std(self.config.retention)
                .map_err(|e| InboxError::Storage(format!("retention out of range: {e}")))?;

        let removed = self.store.cleanup(horizon)?;
        if removed > 0 {
            debug!(processor = %self.config.name, removed, "inbox retention cleanup");
        }
        self.stats.lock().unwrap().cleaned_up += removed as u64;
        Ok(removed)
    }
}

impl<S, C> InboxProcessor<S, C>
where
    S: InboxStore + OrderReadStore + 'static,
    C: Clock + 'static,
{
    /// Spawn the fixed-delay processing sweep.
    pub fn spawn(self: &Arc<Self>) -> WorkerHandle {
        let processor = Arc::clone(self);
        Sweeper::spawn(
            SweeperConfig::new(self.config.name.clone(), self.config.poll_interval),
            move || processor.process_batch(),
        )
    }

    /// Spawn the independent, longer-period retention sweep.
    pub fn spawn_cleanup(self: &Arc<Self>) -> WorkerHandle {
        let processor = Arc::clone(self);
        Sweeper::spawn(
            SweeperConfig::new(
                format!("{}-cleanup", self.config.name),
                self.config.cleanup_interval,
            ),
            move || processor.run_cleanup(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbox::in_memory::InMemoryReadSide;
    use crate::inbox::store::{NewInboxRecord, ProcessingStatus};
    use chrono::Utc;
    use orderflow_core::{EventId, FixedClock, MessageId, OrderId};
    use orderflow_events::Envelope;
    use orderflow_orders::{OrderEvent, OrderPatch};

    fn processor(
        store: Arc<InMemoryReadSide>,
        clock: FixedClock,
        retry: RetryPolicy,
    ) -> InboxProcessor<Arc<InMemoryReadSide>, FixedClock> {
        let config = ProcessorConfig {
            lease: Duration::from_secs(0),
            retry,
            ..ProcessorConfig::default()
        };
        InboxProcessor::new(store, clock, CodecRegistry::with_defaults(), config).unwrap()
    }

    fn stage(
        store: &InMemoryReadSide,
        clock: &FixedClock,
        order_id: OrderId,
        event: OrderEvent,
    ) -> EventId {
        let event_id = EventId::new();
        let env = Envelope::new(event_id, MessageId::new(), order_id, clock.now(), event);
        let kind = env.payload.kind();
        store
            .record_received(
                NewInboxRecord {
                    event_id,
                    message_id: Some(env.message_id),
                    event_type: kind.as_str().to_string(),
                    target_entity_id: Some(order_id),
                    depends_on_event_type: None,
                    occurred_at: env.timestamp,
                    payload: serde_json::to_value(&env).unwrap(),
                },
                clock.now(),
            )
            .unwrap();
        event_id
    }

    #[test]
    fn startup_rejects_incomplete_registry() {
        let err = InboxProcessor::new(
            Arc::new(InMemoryReadSide::new()),
            FixedClock::at(Utc::now()),
            CodecRegistry::new(),
            ProcessorConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, CodecError::MissingDecoder(_)));
    }

    #[test]
    fn create_then_update_reach_the_read_model() {
        let store = Arc::new(InMemoryReadSide::new());
        let clock = FixedClock::at(Utc::now());
        let order_id = OrderId::new();

        stage(&store, &clock, order_id, OrderEvent::created(7, 1050, "NEW"));
        assert_eq!(
            processor(store.clone(), clock.clone(), RetryPolicy::default())
                .process_batch()
                .unwrap(),
            1
        );

        let update = OrderEvent::updated(OrderPatch::new().status("SHIPPED")).unwrap();
        stage(&store, &clock, order_id, update);
        assert_eq!(
            processor(store.clone(), clock.clone(), RetryPolicy::default())
                .process_batch()
                .unwrap(),
            1
        );

        let row = store.get(order_id).unwrap().unwrap();
        assert_eq!(row.status, "SHIPPED");
        assert_eq!(row.amount_cents, 1050);
    }

    #[test]
    fn update_before_create_fails_then_succeeds_after_create_lands() {
        let store = Arc::new(InMemoryReadSide::new());
        let clock = FixedClock::at(Utc::now());
        let order_id = OrderId::new();
        let retry = RetryPolicy::fixed(5, Duration::from_secs(0));
        let proc = processor(store.clone(), clock.clone(), retry);

        let update = OrderEvent::updated(OrderPatch::new().amount(9900)).unwrap();
        let update_id = stage(&store, &clock, order_id, update);

        // Out-of-order arrival: the update defers.
        assert_eq!(proc.process_batch().unwrap(), 0);
        let failed = store.find(update_id).unwrap().unwrap();
        assert_eq!(failed.status, ProcessingStatus::Failed);
        assert_eq!(failed.attempts, 1);
        assert!(failed.error_message.is_some());

        // The create arrives. The sweep claims oldest-first, so the update is
        // retried before the create lands and fails once more; the sweep after
        // that finds the row and succeeds.
        stage(&store, &clock, order_id, OrderEvent::created(7, 1050, "NEW"));
        assert_eq!(proc.process_batch().unwrap(), 1);
        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(proc.process_batch().unwrap(), 1);

        let row = store.get(order_id).unwrap().unwrap();
        assert_eq!(row.amount_cents, 9900);
        assert_eq!(
            store.find(update_id).unwrap().unwrap().status,
            ProcessingStatus::Processed
        );
    }

    #[test]
    fn record_expires_after_attempt_ceiling() {
        let store = Arc::new(InMemoryReadSide::new());
        let clock = FixedClock::at(Utc::now());
        let order_id = OrderId::new();
        let retry = RetryPolicy::fixed(3, Duration::from_secs(0));
        let proc = processor(store.clone(), clock.clone(), retry);

        // An update with no create ever arriving fails deterministically.
        let update = OrderEvent::updated(OrderPatch::new().amount(9900)).unwrap();
        let event_id = stage(&store, &clock, order_id, update);

        for _ in 0..3 {
            proc.process_batch().unwrap();
            clock.advance(chrono::Duration::seconds(1));
        }

        let record = store.find(event_id).unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::Expired);
        assert_eq!(record.attempts, 3);

        // Terminal: further sweeps leave it alone.
        assert_eq!(proc.process_batch().unwrap(), 0);
        assert_eq!(store.find(event_id).unwrap().unwrap().attempts, 3);

        let stats = proc.stats();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.failures, 3);
    }

    #[test]
    fn malformed_payload_is_retried_not_crashed() {
        let store = Arc::new(InMemoryReadSide::new());
        let clock = FixedClock::at(Utc::now());
        let proc = processor(
            store.clone(),
            clock.clone(),
            RetryPolicy::fixed(5, Duration::from_secs(60)),
        );

        let event_id = EventId::new();
        store
            .record_received(
                NewInboxRecord {
                    event_id,
                    message_id: None,
                    event_type: "CREATE".to_string(),
                    target_entity_id: Some(OrderId::new()),
                    depends_on_event_type: None,
                    occurred_at: clock.now(),
                    payload: serde_json::json!({ "operation": "CREATE", "customerId": "seven" }),
                },
                clock.now(),
            )
            .unwrap();

        assert_eq!(proc.process_batch().unwrap(), 0);
        let record = store.find(event_id).unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::Failed);
        assert!(record.error_message.unwrap().contains("malformed"));
        assert!(record.next_attempt_at.unwrap() > clock.now());
    }
}
