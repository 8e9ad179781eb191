//! Cooperative shutdown.
//!
//! One `watch` channel carries the stop request to every worker. Workers
//! observe it at each retry boundary and timer wait through a
//! [`ShutdownSignal`]. The [`ShutdownCoordinator`] owns the sender, the worker
//! handles and the final flush.

use crate::recorder::FlushScheduler;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

// =============================================================================
// Signal
// =============================================================================

/// Receiving end of the stop request. Cheap to clone.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// A dropped sender counts as a stop request.
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once a stop has been requested. Cancel safe.
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Create a linked sender and signal.
pub fn channel() -> (watch::Sender<bool>, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (tx, ShutdownSignal { rx })
}

// =============================================================================
// Coordinator
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorState::Running => write!(f, "RUNNING"),
            CoordinatorState::Draining => write!(f, "DRAINING"),
            CoordinatorState::Stopped => write!(f, "STOPPED"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("shutdown already {0}")]
    AlreadyRunning(CoordinatorState),
}

/// What happened during shutdown.
#[derive(Debug, Default, Clone)]
pub struct ShutdownReport {
    pub workers_joined: usize,
    /// Names of workers that panicked.
    pub workers_panicked: Vec<String>,
    /// Rows persisted by the final drain.
    pub final_flush_rows: usize,
    /// Rows still unpersisted after the final drain.
    pub unflushed_rows: usize,
}

pub struct ShutdownCoordinator {
    state: Mutex<CoordinatorState>,
    tx: watch::Sender<bool>,
    signal: ShutdownSignal,
    workers: Mutex<Vec<(String, JoinHandle<()>)>>,
    final_flush: Mutex<Option<Arc<FlushScheduler>>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, signal) = channel();
        Self {
            state: Mutex::new(CoordinatorState::Running),
            tx,
            signal,
            workers: Mutex::new(Vec::new()),
            final_flush: Mutex::new(None),
        }
    }

    /// A fresh signal for a worker.
    pub fn signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.lock()
    }

    pub fn register(&self, name: impl Into<String>, handle: JoinHandle<()>) {
        self.workers.lock().push((name.into(), handle));
    }

    /// Drain this scheduler once more after all workers have stopped.
    pub fn set_final_flush(&self, flush: Arc<FlushScheduler>) {
        *self.final_flush.lock() = Some(flush);
    }

    /// Stop every worker and wait for them. Only the first call runs.
    pub async fn shutdown(&self) -> Result<ShutdownReport, ShutdownError> {
        {
            let mut state = self.state.lock();
            if *state != CoordinatorState::Running {
                return Err(ShutdownError::AlreadyRunning(*state));
            }
            *state = CoordinatorState::Draining;
        }
        info!(from = %CoordinatorState::Running, to = %CoordinatorState::Draining, "shutdown_transition");

        // Receivers may all be gone already; that is also a stop.
        let _ = self.tx.send(true);

        let workers = std::mem::take(&mut *self.workers.lock());
        let mut report = ShutdownReport::default();
        for (name, handle) in workers {
            match handle.await {
                Ok(()) => {
                    report.workers_joined += 1;
                    info!(worker = %name, "worker stopped");
                }
                Err(e) if e.is_panic() => {
                    report.workers_joined += 1;
                    error!(worker = %name, "worker panicked");
                    report.workers_panicked.push(name);
                }
                Err(e) => {
                    warn!(worker = %name, error = %e, "worker join failed");
                }
            }
        }

        let flush = self.final_flush.lock().clone();
        if let Some(flush) = flush {
            match flush.drain_and_flush().await {
                Ok(rows) => report.final_flush_rows = rows,
                Err(e) => error!(error = %e, "final flush failed"),
            }
            report.unflushed_rows = flush.buffer().len();
            if report.unflushed_rows > 0 {
                warn!(rows = report.unflushed_rows, "exiting with unflushed change records");
            }
        }

        *self.state.lock() = CoordinatorState::Stopped;
        info!(
            from = %CoordinatorState::Draining,
            to = %CoordinatorState::Stopped,
            workers = report.workers_joined,
            panicked = report.workers_panicked.len(),
            final_flush_rows = report.final_flush_rows,
            "shutdown_transition"
        );
        Ok(report)
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
