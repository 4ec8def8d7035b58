//! Write-side outbox: durable staging + periodic publisher.
//!
//! Events are staged in the same transaction as the command-ledger append and
//! published later by a fixed-delay sweep, so a change is never lost even if
//! the message channel is down when it happens.

pub mod in_memory;
pub mod postgres;
pub mod publisher;
pub mod store;

pub use in_memory::InMemoryOutboxStore;
pub use postgres::PostgresOutboxStore;
pub use publisher::{OutboxPublisher, PublisherConfig, PublisherStats};
pub use store::{
    AppendOutcome, NewOutboxRecord, OutboxEntryId, OutboxError, OutboxRecord, OutboxStore,
};
