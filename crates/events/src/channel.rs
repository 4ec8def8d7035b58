//! Message-channel abstraction (mechanics only).
//!
//! The channel is the **transport** between the write side's outbox and the read
//! side's inbox. It is intentionally a thin contract:
//!
//! - **Transport-agnostic**: in-memory channels for tests, a broker in production.
//! - **At-least-once delivery**: messages may arrive more than once; both sides
//!   deduplicate on the event identity carried in the envelope.
//! - **No persistence**: durability lives in the outbox and inbox stores, not here.
//!   If a publish fails, the outbox record stays unpublished and is retried.
//!
//! Consumers must be idempotent - receiving the same logical event twice must
//! have the same effect as receiving it once.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// One message in flight: routing metadata plus the serialized envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    /// Logical route (e.g. exchange) the producer addressed.
    pub route: String,
    /// Destination channel (e.g. routing key / queue name).
    pub channel: String,
    /// Serialized wire envelope.
    pub body: Vec<u8>,
}

impl ChannelMessage {
    pub fn new(route: impl Into<String>, channel: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            route: route.into(),
            channel: channel.into(),
            body,
        }
    }
}

/// A subscription to a channel's delivery stream.
///
/// Each subscription gets a copy of every published message (broadcast
/// semantics). Designed for single-threaded consumption; the ingress worker owns
/// one subscription and runs the listener on its delivery thread.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Publish/subscribe contract for the event transport.
///
/// `publish()` can fail (broker down, channel full). Failures are surfaced to the
/// outbox publisher, which leaves the record unpublished; since the envelope is
/// already staged durably, retrying on the next sweep is safe.
pub trait MessageChannel: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: ChannelMessage) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<ChannelMessage>;
}

impl<C> MessageChannel for Arc<C>
where
    C: MessageChannel + ?Sized,
{
    type Error = C::Error;

    fn publish(&self, message: ChannelMessage) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<ChannelMessage> {
        (**self).subscribe()
    }
}
