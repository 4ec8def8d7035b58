//! Ingress worker: runs a handler on the channel's delivery thread.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::channel::{ChannelMessage, MessageChannel, Subscription};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn new(shutdown: mpsc::Sender<()>, join: thread::JoinHandle<()>) -> Self {
        Self {
            shutdown,
            join: Some(join),
        }
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Generic ingress worker loop.
///
/// - Subscribes to a message channel
/// - Invokes the handler for each delivery, on this thread
/// - Supports graceful shutdown
///
/// The handler is the inbox listener's fast path: it must only deduplicate and
/// store, never run the projection inline. A handler error is logged and the
/// message dropped; the channel collaborator owns redelivery.
#[derive(Debug)]
pub struct IngressWorker;

impl IngressWorker {
    pub fn spawn<B, H, E>(name: &'static str, channel: B, mut handler: H) -> WorkerHandle
    where
        B: MessageChannel + Send + Sync + 'static,
        H: FnMut(ChannelMessage) -> Result<(), E> + Send + 'static,
        E: core::fmt::Debug + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub: Subscription<ChannelMessage> = channel.subscribe();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || ingress_loop(name, sub, shutdown_rx, &mut handler))
            .expect("failed to spawn ingress worker thread");

        WorkerHandle::new(shutdown_tx, join)
    }
}

fn ingress_loop<H, E>(
    name: &'static str,
    sub: Subscription<ChannelMessage>,
    shutdown_rx: mpsc::Receiver<()>,
    handler: &mut H,
) where
    H: FnMut(ChannelMessage) -> Result<(), E>,
    E: core::fmt::Debug,
{
    let tick = Duration::from_millis(250);

    loop {
        // Shutdown check (non-blocking)
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match sub.recv_timeout(tick) {
            Ok(msg) => {
                if let Err(err) = handler(msg) {
                    warn!(worker = name, error = ?err, "ingress handler failed");
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}
