//! `orderflow-events` — event transport machinery.
//!
//! Domain-agnostic pieces of the event pipeline: the wire envelope, the
//! message-channel contract, an in-memory channel for tests/dev, and the
//! ingress worker that feeds channel deliveries to the inbox listener.

pub mod channel;
pub mod envelope;
pub mod in_memory_channel;
pub mod ingress;

pub use channel::{ChannelMessage, MessageChannel, Subscription};
pub use envelope::{Envelope, EnvelopeHeader};
pub use in_memory_channel::{InMemoryChannel, InMemoryChannelError};
pub use ingress::{IngressWorker, WorkerHandle};
