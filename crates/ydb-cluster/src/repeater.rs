//! Periodic task runner with coalesced forced runs.
//!
//! ```text
//! loop
//!   ├── stop        → exit
//!   ├── force()     → wait out MIN_FORCE_INTERVAL since the last forced run,
//!   │                 absorb forces that arrived meanwhile, run
//!   └── interval    → run
//! task error → one self-issued force()
//! ```
//!
//! Runs never overlap: the worker awaits each run before selecting again.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use ydb_core::{Context, Error, Observer, Observers, WakeUp};

/// Minimum spacing between two forced runs.
pub const MIN_FORCE_INTERVAL: Duration = Duration::from_secs(1);

pub struct Repeater {
    name: String,
    ctx: Context,
    force_tx: mpsc::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Repeater {
    /// Spawn the worker. A zero `interval` disables ticks; the task then
    /// runs only when forced.
    pub fn spawn<F, Fut>(
        name: impl Into<String>,
        interval: Duration,
        observers: Observers,
        task: F,
    ) -> Self
    where
        F: FnMut(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let name = name.into();
        let ctx = Context::background();
        // Capacity 1: at most one force is ever pending.
        let (force_tx, force_rx) = mpsc::channel(1);

        let worker = Worker {
            name: name.clone(),
            interval,
            ctx: ctx.clone(),
            force_tx: force_tx.clone(),
            force_rx,
            observers,
        };
        let handle = tokio::spawn(worker.run(task));
        debug!(repeater = %name, ?interval, "repeater started");

        Self {
            name,
            ctx,
            force_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request an out-of-cycle run. Dropped if one is already pending.
    pub fn force(&self) {
        if self.force_tx.try_send(()).is_err() {
            debug!(repeater = %self.name, "force already pending");
        }
    }

    /// Cancel the worker. Safe to call more than once.
    pub fn stop(&self) {
        self.ctx.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.ctx.is_done()
    }

    /// Stop and wait for the worker to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.handle.lock().expect("repeater handle lock").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(repeater = %self.name, error = %e, "repeater worker failed");
            }
        }
    }
}

impl Drop for Repeater {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Repeater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repeater")
            .field("name", &self.name)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

struct Worker {
    name: String,
    interval: Duration,
    ctx: Context,
    force_tx: mpsc::Sender<()>,
    force_rx: mpsc::Receiver<()>,
    observers: Observers,
}

impl Worker {
    async fn run<F, Fut>(mut self, mut task: F)
    where
        F: FnMut(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let ticks = !self.interval.is_zero();
        let mut last_force: Option<Instant> = None;

        loop {
            let event = tokio::select! {
                biased;
                _ = self.ctx.done() => break,
                Some(()) = self.force_rx.recv() => WakeUp::Force,
                _ = tokio::time::sleep(self.interval), if ticks => WakeUp::Tick,
            };

            if event == WakeUp::Force {
                if let Some(last) = last_force {
                    let wait = (last + MIN_FORCE_INTERVAL).saturating_duration_since(Instant::now());
                    if !wait.is_zero() {
                        debug!(repeater = %self.name, ?wait, "delaying forced run");
                        if self.ctx.run(tokio::time::sleep(wait)).await.is_err() {
                            break;
                        }
                    }
                }
                // Forces that arrived while waiting collapse into this run.
                while self.force_rx.try_recv().is_ok() {}
                last_force = Some(Instant::now());
            }

            debug!(repeater = %self.name, %event, "repeater wake up");
            let result = match self.ctx.run(task(self.ctx.child())).await {
                Ok(result) => result,
                Err(_) => break,
            };

            self.observers
                .on_repeater_wake_up(&self.name, event, result.as_ref().err());
            if let Err(e) = result {
                warn!(repeater = %self.name, %event, error = %e, "repeater task failed");
                let _ = self.force_tx.try_send(());
            }
        }
        debug!(repeater = %self.name, "repeater stopped");
    }
}
