//! Periodic single-flight publisher draining the outbox to the channel.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use orderflow_core::Clock;
use orderflow_events::{ChannelMessage, MessageChannel, WorkerHandle};

use super::store::{OutboxError, OutboxRecord, OutboxStore};
use crate::sweeper::{Sweeper, SweeperConfig};

/// Publisher configuration.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Name for logging/threads.
    pub name: String,
    /// Fixed delay between sweeps.
    pub poll_interval: Duration,
    /// Max records drained per sweep.
    pub batch_size: usize,
    /// Claim owner recorded on leased rows (instance identity).
    pub claimant: String,
    /// Lease duration for claimed rows.
    pub lease: Duration,
    /// Published records older than this are eligible for cleanup.
    pub retention: Duration,
    /// Fixed delay between retention sweeps (longer than `poll_interval`).
    pub cleanup_interval: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            name: "outbox-publisher".to_string(),
            poll_interval: Duration::from_secs(30),
            batch_size: 50,
            claimant: format!("outbox-publisher/{}", uuid::Uuid::now_v7()),
            lease: Duration::from_secs(60),
            retention: Duration::from_secs(7 * 24 * 3600),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

impl PublisherConfig {
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

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

/// Publisher runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PublisherStats {
    pub sweeps: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub cleaned_up: u64,
}

/// Drains unpublished outbox rows to the message channel.
///
/// Runs as a fixed-delay sweep; within a sweep records are handled
/// sequentially, oldest-created-first, and one record's failure never blocks
/// the rest of the batch. A failed publish leaves the row unpublished for the
/// next sweep (at-least-once delivery).
pub struct OutboxPublisher<S, B, C> {
    store: S,
    channel: B,
    clock: C,
    config: PublisherConfig,
    stats: Mutex<PublisherStats>,
}

impl<S, B, C> OutboxPublisher<S, B, C>
where
    S: OutboxStore,
    B: MessageChannel,
    C: Clock,
{
    pub fn new(store: S, channel: B, clock: C, config: PublisherConfig) -> Self {
        Self {
            store,
            channel,
            clock,
            config,
            stats: Mutex::new(PublisherStats::default()),
        }
    }

    pub fn stats(&self) -> PublisherStats {
        self.stats.lock().unwrap().clone()
    }

    /// One publish sweep: claim a batch and push each record to the channel.
    /// Returns how many records were published.
    pub fn publish_batch(&self) -> Result<usize, OutboxError> {
        let now = self.clock.now();
        let batch = self.store.claim_unpublished(
            self.config.batch_size,
            &self.config.claimant,
            self.config.lease,
            now,
        )?;

        let mut published = 0;
        for record in batch {
            if self.publish_one(&record)? {
                published += 1;
            }
        }

        let mut stats = self.stats.lock().unwrap();
        stats.sweeps += 1;
        stats.published += published as u64;

        Ok(published)
    }

    fn publish_one(&self, record: &OutboxRecord) -> Result<bool, OutboxError> {
        let body = serde_json::to_vec(&record.payload)
            .map_err(|e| OutboxError::Serialization(e.to_string()))?;
        let message = ChannelMessage::new(record.route.clone(), record.channel.clone(), body);

        match self.channel.publish(message) {
            Ok(()) => {
                self.store.mark_published(record.id, self.clock.now())?;
                debug!(
                    publisher = %self.config.name,
                    event_id = %record.event_id,
                    event_type = %record.event_type,
                    "published outbox record"
                );
                Ok(true)
            }
            Err(err) => {
                let error = format!("channel publish failed: {err:?}");
                warn!(
                    publisher = %self.config.name,
                    event_id = %record.event_id,
                    error = %error,
                    "outbox publish failed; will retry"
                );
                self.store.record_failure(record.id, &error)?;
                self.stats.lock().unwrap().publish_failures += 1;
                Ok(false)
            }
        }
    }

    /// Retention sweep: drop published rows older than the horizon.
    pub fn run_cleanup(&self) -> Result<usize, OutboxError> {
        let horizon = self.clock.now()
            - chrono::Duration::from_std(self.config.retention)
                .map_err(|e| OutboxError::Storage(format!("retention out of range: {e}")))?;

        let removed = self.store.cleanup(horizon)?;
        if removed > 0 {
            debug!(publisher = %self.config.name, removed, "outbox retention cleanup");
        }
        self.stats.lock().unwrap().cleaned_up += removed as u64;
        Ok(removed)
    }
}

impl<S, B, C> OutboxPublisher<S, B, C>
where
    S: OutboxStore + 'static,
    B: MessageChannel + 'static,
    C: Clock + 'static,
{
    /// Spawn the fixed-delay publish sweep.
    pub fn spawn(self: &Arc<Self>) -> WorkerHandle {
        let publisher = Arc::clone(self);
        Sweeper::spawn(
            SweeperConfig::new(self.config.name.clone(), self.config.poll_interval),
            move || publisher.publish_batch(),
        )
    }

    /// Spawn the independent, longer-period retention sweep.
    pub fn spawn_cleanup(self: &Arc<Self>) -> WorkerHandle {
        let publisher = Arc::clone(self);
        Sweeper::spawn(
            SweeperConfig::new(
                format!("{}-cleanup", self.config.name),
                self.config.cleanup_interval,
            ),
            move || publisher.run_cleanup(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::in_memory::InMemoryOutboxStore;
    use crate::outbox::store::NewOutboxRecord;
    use chrono::Utc;
    use orderflow_core::{EventId, FixedClock};
    use orderflow_events::InMemoryChannel;
    use serde_json::json;

    fn publisher(
        store: Arc<InMemoryOutboxStore>,
        channel: Arc<InMemoryChannel>,
        clock: FixedClock,
    ) -> OutboxPublisher<Arc<InMemoryOutboxStore>, Arc<InMemoryChannel>, FixedClock> {
        // Zero lease so tests can re-poll without waiting out a lease window.
        let config = PublisherConfig {
            lease: Duration::from_secs(0),
            ..PublisherConfig::default()
        };
        OutboxPublisher::new(store, channel, clock, config)
    }

    fn stage(store: &InMemoryOutboxStore, clock: &FixedClock) -> EventId {
        let event_id = EventId::new();
        store
            .append(
                NewOutboxRecord {
                    event_id,
                    event_type: "CREATE".to_string(),
                    payload: json!({ "operation": "CREATE", "eventId": event_id }),
                    route: "orders".to_string(),
                    channel: "orders.events".to_string(),
                },
                clock.now(),
            )
            .unwrap();
        event_id
    }

    #[test]
    fn publishes_and_marks_records() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let channel = Arc::new(InMemoryChannel::new());
        let clock = FixedClock::at(Utc::now());
        let sub = channel.subscribe();

        let event_id = stage(&store, &clock);
        let publisher = publisher(store.clone(), channel, clock);

        assert_eq!(publisher.publish_batch().unwrap(), 1);
        assert!(sub.try_recv().is_ok());
        assert!(store.find(event_id).unwrap().unwrap().published);

        // Next sweep finds nothing.
        assert_eq!(publisher.publish_batch().unwrap(), 0);
    }

    #[test]
    fn failed_publish_stays_unpublished_until_channel_recovers() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let channel = Arc::new(InMemoryChannel::new());
        let clock = FixedClock::at(Utc::now());

        let event_id = stage(&store, &clock);
        let publisher = publisher(store.clone(), channel.clone(), clock);

        channel.set_available(false);
        assert_eq!(publisher.publish_batch().unwrap(), 0);
        assert_eq!(publisher.publish_batch().unwrap(), 0);

        let record = store.find(event_id).unwrap().unwrap();
        assert!(!record.published);
        assert!(record.last_error.is_some());

        channel.set_available(true);
        assert_eq!(publisher.publish_batch().unwrap(), 1);
        assert!(store.find(event_id).unwrap().unwrap().published);
        assert_eq!(publisher.publish_batch().unwrap(), 0);

        let stats = publisher.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.publish_failures, 2);
    }
}
