//! In-memory message channel for tests/dev.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, mpsc};

use crate::channel::{ChannelMessage, MessageChannel, Subscription};

#[derive(Debug)]
pub enum InMemoryChannelError {
    /// Publish failed due to internal lock poisoning.
    Poisoned,
    /// Publish rejected because the channel was forced down (test hook).
    Unavailable,
}

/// In-memory pub/sub channel.
///
/// - No IO / no async
/// - Best-effort fan-out
/// - At-least-once acceptable (subscribers must be idempotent)
///
/// `set_available(false)` simulates a broker outage so tests can exercise the
/// outbox retry path.
#[derive(Debug)]
pub struct InMemoryChannel {
    subscribers: Mutex<Vec<mpsc::Sender<ChannelMessage>>>,
    available: AtomicBool,
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated availability. While unavailable, every publish fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl Default for InMemoryChannel {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl MessageChannel for InMemoryChannel {
    type Error = InMemoryChannelError;

    fn publish(&self, message: ChannelMessage) -> Result<(), Self::Error> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(InMemoryChannelError::Unavailable);
        }

        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| InMemoryChannelError::Poisoned)?;

        // Drop any dead subscribers while publishing.
        subs.retain(|tx| tx.send(message.clone()).is_ok());

        Ok(())
    }

    fn subscribe(&self) -> Subscription<ChannelMessage> {
        let (tx, rx) = mpsc::channel();

        // If the lock is poisoned, we still return a subscription;
        // it just won't receive messages until the process restarts.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(n: u8) -> ChannelMessage {
        ChannelMessage::new("orders", "orders.events", vec![n])
    }

    #[test]
    fn subscribers_receive_published_messages() {
        let bus = InMemoryChannel::new();
        let sub = bus.subscribe();

        bus.publish(msg(1)).unwrap();
        bus.publish(msg(2)).unwrap();

        assert_eq!(sub.try_recv().unwrap().body, vec![1]);
        assert_eq!(sub.try_recv().unwrap().body, vec![2]);
        assert!(sub.try_recv().is_err());
    }

    #[test]
    fn unavailable_channel_rejects_publish() {
        let bus = InMemoryChannel::new();
        let sub = bus.subscribe();

        bus.set_available(false);
        assert!(matches!(
            bus.publish(msg(1)),
            Err(InMemoryChannelError::Unavailable)
        ));
        assert!(sub.try_recv().is_err());

        bus.set_available(true);
        bus.publish(msg(2)).unwrap();
        assert_eq!(sub.try_recv().unwrap().body, vec![2]);
    }
}
