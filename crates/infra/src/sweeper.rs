//! Fixed-delay background sweeps.
//!
//! Both the outbox publisher and the inbox processor run as fixed-delay (not
//! fixed-rate) periodic tasks: the next tick is scheduled only after the
//! previous run completes, so a single process instance never overlaps its own
//! sweep. Retention cleanups reuse the same loop on a longer period.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info};

use orderflow_events::WorkerHandle;

/// Fixed-delay sweep configuration.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Name for the thread and log fields.
    pub name: String,
    /// Delay between the end of one tick and the start of the next.
    pub interval: Duration,
}

impl SweeperConfig {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
        }
    }
}

/// Spawner for fixed-delay sweep loops.
#[derive(Debug)]
pub struct Sweeper;

impl Sweeper {
    /// Spawn a sweep thread running `tick` once per interval.
    ///
    /// `tick` returns how many records it handled; errors are logged and the
    /// loop keeps going - one bad sweep never kills the scheduler.
    pub fn spawn<F, E>(config: SweeperConfig, mut tick: F) -> WorkerHandle
    where
        F: FnMut() -> Result<usize, E> + Send + 'static,
        E: core::fmt::Debug + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let name = config.name.clone();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || sweep_loop(config, shutdown_rx, &mut tick))
            .expect("failed to spawn sweeper thread");

        WorkerHandle::new(shutdown_tx, join)
    }
}

fn sweep_loop<F, E>(config: SweeperConfig, shutdown_rx: mpsc::Receiver<()>, tick: &mut F)
where
    F: FnMut() -> Result<usize, E>,
    E: core::fmt::Debug,
{
    info!(sweeper = %config.name, "sweeper started");

    loop {
        match tick() {
            Ok(0) => {}
            Ok(n) => debug!(sweeper = %config.name, records = n, "sweep tick"),
            Err(e) => error!(sweeper = %config.name, error = ?e, "sweep tick failed"),
        }

        // Fixed delay: wait out the interval after the tick completed, waking
        // early only for shutdown.
        match shutdown_rx.recv_timeout(config.interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
        }
    }

    info!(sweeper = %config.name, "sweeper stopped");
}
