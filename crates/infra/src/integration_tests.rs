//! End-to-end pipeline tests over the in-memory backends.
//!
//! These wire the full path by hand - write side, outbox publisher, channel,
//! inbox listener, processor, read model - and drive the sweeps synchronously
//! so every assertion runs against a quiesced pipeline.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use orderflow_core::{FixedClock, OrderId};
use orderflow_events::{InMemoryChannel, MessageChannel, Subscription};
use orderflow_orders::{CANCELLED_STATUS, CodecRegistry, OrderPatch};

use crate::inbox::{
    InMemoryReadSide, InboxListener, InboxProcessor, InboxStore, OrderReadStore, ProcessingStatus,
    ProcessorConfig,
};
use crate::outbox::{OutboxPublisher, PublisherConfig};
use crate::retry::RetryPolicy;
use crate::write::{InMemoryWriteStore, WriteConfig, WriteSide};

struct Pipeline {
    clock: FixedClock,
    write: WriteSide<Arc<InMemoryWriteStore>, FixedClock>,
    channel: Arc<InMemoryChannel>,
    subscription: Subscription<orderflow_events::ChannelMessage>,
    publisher: OutboxPublisher<Arc<InMemoryWriteStore>, Arc<InMemoryChannel>, FixedClock>,
    read_side: Arc<InMemoryReadSide>,
    listener: InboxListener<Arc<InMemoryReadSide>, FixedClock>,
    processor: InboxProcessor<Arc<InMemoryReadSide>, FixedClock>,
}

impl Pipeline {
    fn new() -> Self {
        let clock = FixedClock::at(Utc::now());
        let write_store = Arc::new(InMemoryWriteStore::new());
        let channel = Arc::new(InMemoryChannel::new());
        let subscription = channel.subscribe();
        let read_side = Arc::new(InMemoryReadSide::new());

        let write = WriteSide::new(write_store.clone(), clock.clone(), WriteConfig::default());
        let publisher = OutboxPublisher::new(
            write_store.clone(),
            channel.clone(),
            clock.clone(),
            PublisherConfig {
                lease: Duration::from_secs(0),
                ..PublisherConfig::default()
            },
        );
        let listener = InboxListener::new(read_side.clone(), clock.clone());
        let processor = InboxProcessor::new(
            read_side.clone(),
            clock.clone(),
            CodecRegistry::with_defaults(),
            ProcessorConfig {
                lease: Duration::from_secs(0),
                retry: RetryPolicy::fixed(5, Duration::from_secs(0)),
                ..ProcessorConfig::default()
            },
        )
        .unwrap();

        Self {
            clock,
            write,
            channel,
            subscription,
            publisher,
            read_side,
            listener,
            processor,
        }
    }

    /// Drain outbox -> channel -> inbox -> read model until nothing moves.
    fn settle(&self) {
        loop {
            let published = self.publisher.publish_batch().unwrap();
            let mut delivered = 0;
            while let Ok(msg) = self.subscription.try_recv() {
                self.listener.record_received(&msg.body).unwrap();
                delivered += 1;
            }
            let processed = self.processor.process_batch().unwrap();
            self.clock.advance(chrono::Duration::seconds(1));

            if published == 0 && delivered == 0 && processed == 0 {
                break;
            }
        }
    }
}

#[test]
fn write_side_changes_reach_the_read_model() {
    let pipeline = Pipeline::new();

    let created = pipeline.write.create_order(7, 1050, "NEW").unwrap();
    pipeline
        .write
        .update_order(created.order_id, OrderPatch::new().status("SHIPPED"))
        .unwrap();
    pipeline.settle();

    let row = pipeline.read_side.get(created.order_id).unwrap().unwrap();
    assert_eq!(row.customer_id, 7);
    assert_eq!(row.amount_cents, 1050);
    assert_eq!(row.status, "SHIPPED");

    // Both sides agree on the current state.
    let view = pipeline.write.current_state(created.order_id).unwrap();
    assert_eq!(view.status, row.status);
    assert_eq!(view.amount_cents, row.amount_cents);
}

#[test]
fn cancellation_removes_the_read_row_but_keeps_history() {
    let pipeline = Pipeline::new();

    let created = pipeline.write.create_order(7, 1050, "NEW").unwrap();
    pipeline.write.cancel_order(created.order_id).unwrap();
    pipeline.settle();

    assert!(pipeline.read_side.get(created.order_id).unwrap().is_none());

    let view = pipeline.write.current_state(created.order_id).unwrap();
    assert!(view.deleted);
    assert_eq!(view.status, CANCELLED_STATUS);
}

#[test]
fn redelivered_messages_have_exactly_one_effect() {
    let pipeline = Pipeline::new();

    let created = pipeline.write.create_order(7, 1050, "NEW").unwrap();
    pipeline.publisher.publish_batch().unwrap();

    let msg = pipeline.subscription.try_recv().unwrap();
    // The channel redelivers the same envelope three times.
    for _ in 0..3 {
        pipeline.listener.record_received(&msg.body).unwrap();
    }
    pipeline.processor.process_batch().unwrap();

    assert_eq!(pipeline.read_side.stats().unwrap().total, 1);
    assert!(pipeline.read_side.get(created.order_id).unwrap().is_some());
}

#[test]
fn channel_outage_loses_nothing() {
    let pipeline = Pipeline::new();

    let created = pipeline.write.create_order(7, 1050, "NEW").unwrap();

    // Broker down: sweeps fail, the record stays staged.
    pipeline.channel.set_available(false);
    assert_eq!(pipeline.publisher.publish_batch().unwrap(), 0);
    pipeline.clock.advance(chrono::Duration::seconds(30));
    assert_eq!(pipeline.publisher.publish_batch().unwrap(), 0);

    // Broker back: the next sweep delivers and the read model catches up.
    pipeline.channel.set_available(true);
    pipeline.settle();

    assert!(pipeline.read_side.get(created.order_id).unwrap().is_some());
    assert_eq!(pipeline.publisher.stats().publish_failures, 2);
}

#[test]
fn interleaved_lineages_project_independently() {
    let pipeline = Pipeline::new();

    let a = pipeline.write.create_order(1, 100, "NEW").unwrap();
    let b = pipeline.write.create_order(2, 200, "NEW").unwrap();
    pipeline
        .write
        .update_order(a.order_id, OrderPatch::new().amount(150))
        .unwrap();
    pipeline.write.cancel_order(b.order_id).unwrap();
    pipeline
        .write
        .update_order(a.order_id, OrderPatch::new().status("SHIPPED"))
        .unwrap();
    pipeline.settle();

    let row_a = pipeline.read_side.get(a.order_id).unwrap().unwrap();
    assert_eq!(row_a.amount_cents, 150);
    assert_eq!(row_a.status, "SHIPPED");
    assert!(pipeline.read_side.get(b.order_id).unwrap().is_none());

    let rows = pipeline.read_side.list().unwrap();
    assert_eq!(rows.len(), 1);
}

#[test]
fn processed_records_survive_until_retention_expires() {
    let pipeline = Pipeline::new();

    pipeline.write.create_order(7, 1050, "NEW").unwrap();
    pipeline.settle();

    let stats = pipeline.read_side.stats().unwrap();
    assert_eq!(stats.processed, 1);

    // Retention horizon in the future removes it; publisher cleanup likewise.
    pipeline.clock.advance(chrono::Duration::days(8));
    assert_eq!(pipeline.processor.run_cleanup().unwrap(), 1);
    assert_eq!(pipeline.publisher.run_cleanup().unwrap(), 1);
    assert_eq!(pipeline.read_side.stats().unwrap().total, 0);
}

#[test]
fn update_arriving_before_create_defers_until_the_create_lands() {
    let pipeline = Pipeline::new();

    let created = pipeline.write.create_order(7, 1050, "NEW").unwrap();
    pipeline
        .write
        .update_order(created.order_id, OrderPatch::new().amount(9900))
        .unwrap();
    pipeline.publisher.publish_batch().unwrap();

    let first = pipeline.subscription.try_recv().unwrap();
    let second = pipeline.subscription.try_recv().unwrap();

    // Deliver in reverse order: the update is staged first.
    pipeline.listener.record_received(&second.body).unwrap();
    pipeline.listener.record_received(&first.body).unwrap();

    // First sweep: the update fails (no row yet), the create lands.
    pipeline.processor.process_batch().unwrap();
    let stats = pipeline.read_side.stats().unwrap();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.failed, 1);

    // Next sweep retries the update against the now-present row.
    pipeline.clock.advance(chrono::Duration::seconds(1));
    pipeline.processor.process_batch().unwrap();

    let row = pipeline.read_side.get(created.order_id).unwrap().unwrap();
    assert_eq!(row.amount_cents, 9900);
    assert_eq!(
        pipeline
            .read_side
            .list_by_status(ProcessingStatus::Failed)
            .unwrap()
            .len(),
        0
    );
}

#[test]
fn poisoned_lineage_dead_letters_without_blocking_others() {
    let pipeline = Pipeline::new();

    // An update whose create never arrives: deterministic failure.
    let created = pipeline.write.create_order(7, 1050, "NEW").unwrap();
    pipeline
        .write
        .update_order(created.order_id, OrderPatch::new().amount(9900))
        .unwrap();
    pipeline.publisher.publish_batch().unwrap();

    let _create = pipeline.subscription.try_recv().unwrap();
    let update = pipeline.subscription.try_recv().unwrap();
    pipeline.listener.record_received(&update.body).unwrap();

    // A healthy lineage staged alongside it.
    let healthy = pipeline.write.create_order(8, 500, "NEW").unwrap();
    pipeline.publisher.publish_batch().unwrap();
    while let Ok(msg) = pipeline.subscription.try_recv() {
        pipeline.listener.record_received(&msg.body).unwrap();
    }

    for _ in 0..5 {
        pipeline.processor.process_batch().unwrap();
        pipeline.clock.advance(chrono::Duration::seconds(1));
    }

    // The healthy order projected; the orphaned update expired.
    assert!(pipeline.read_side.get(healthy.order_id).unwrap().is_some());
    let expired = pipeline
        .read_side
        .list_by_status(ProcessingStatus::Expired)
        .unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].attempts, 5);
}

#[test]
fn write_store_rejects_stale_versions_across_the_pipeline() {
    let pipeline = Pipeline::new();
    let created = pipeline.write.create_order(7, 1050, "NEW").unwrap();

    // Two logical writers update concurrently; the service retries the loser,
    // so both land with distinct versions.
    pipeline
        .write
        .update_order(created.order_id, OrderPatch::new().amount(2000))
        .unwrap();
    pipeline
        .write
        .update_order(created.order_id, OrderPatch::new().status("PACKED"))
        .unwrap();
    pipeline.settle();

    let view = pipeline.write.current_state(created.order_id).unwrap();
    assert_eq!(view.version, 3);

    let row = pipeline.read_side.get(created.order_id).unwrap().unwrap();
    assert_eq!(row.amount_cents, 2000);
    assert_eq!(row.status, "PACKED");
}
