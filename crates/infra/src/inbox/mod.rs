//! Read-side inbox: durable staging, dedup, projection, retry, dead-letter.
//!
//! Deliveries land in the inbox via the listener (fast dedup-and-store path),
//! and a fixed-delay processor sweep later decodes them and commits the read
//! model projection together with the terminal PROCESSED transition.

pub mod in_memory;
pub mod listener;
pub mod postgres;
pub mod processor;
pub mod projection;
pub mod store;

pub use in_memory::InMemoryReadSide;
pub use listener::{InboxListener, IngressError};
pub use postgres::PostgresReadSide;
pub use processor::{InboxProcessor, ProcessorConfig, ProcessorStats};
pub use projection::{
    OrderReadModel, OrderReadStore, ProjectionEffect, ProjectionError, project,
};
pub use store::{
    ERROR_MESSAGE_MAX, InboxEntryId, InboxError, InboxRecord, InboxStats, InboxStore,
    NewInboxRecord, ProcessingStatus, ReceiveOutcome, truncate_error,
};
