//! Controller background worker.
//!
//! Runs reconciliation cycles on a fixed cadence until shutdown is signaled.
//!
//! ```text
//! Idle ──tick──▶ Cycling ──done──▶ Idle
//!   │               │
//!   └──shutdown──▶ ShuttingDown ──▶ Stopped
//! ```
//!
//! A cycle that has started triggering restarts finishes before the worker
//! stops; no new cycle starts once shutdown is requested.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::reconciler::{wait_for_shutdown, ReconcileError, Reconciler};

/// Observable state of the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Waiting for the next tick.
    Idle,

    /// A reconciliation cycle is in progress.
    Cycling,

    /// Shutdown observed, finishing in-flight work.
    ShuttingDown,

    /// Terminal state.
    Stopped,
}

/// Worker that runs the reconciliation loop.
pub struct ControllerWorker {
    reconciler: Reconciler,
    interval: Duration,
    state: watch::Sender<LoopState>,
}

impl ControllerWorker {
    /// Create a new worker ticking every `interval`.
    pub fn new(reconciler: Reconciler, interval: Duration) -> Self {
        let (state, _) = watch::channel(LoopState::Idle);
        Self {
            reconciler,
            interval,
            state,
        }
    }

    /// Subscribe to loop state transitions.
    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Run the worker until shutdown is signaled.
    ///
    /// The first cycle runs immediately so the digest baseline is recorded
    /// at startup. Shutdown observed mid-cycle moves the state to
    /// `ShuttingDown` while the cycle is driven to completion.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting controller worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        set_state(&self.state, LoopState::Idle);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = interval.tick() => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }

            set_state(&self.state, LoopState::Cycling);
            let mut watcher = shutdown.clone();
            let mut stopping = false;
            let cycle = self.reconciler.reconcile_once(&shutdown);
            tokio::pin!(cycle);

            let result = loop {
                tokio::select! {
                    result = &mut cycle => break result,
                    _ = wait_for_shutdown(&mut watcher), if !stopping => {
                        stopping = true;
                        set_state(&self.state, LoopState::ShuttingDown);
                    }
                }
            };

            match result {
                Ok(report) => {
                    debug!(
                        cycle = report.cycle,
                        directives = report.directives.len(),
                        "Cycle finished"
                    );
                }
                Err(ReconcileError::Cancelled(stage)) => {
                    info!(stage, "Cycle cancelled by shutdown");
                }
                Err(e) => {
                    warn!(error = %e, "Cycle abandoned, retrying at next tick");
                }
            }

            if stopping || *shutdown.borrow() {
                break;
            }
            set_state(&self.state, LoopState::Idle);
        }

        set_state(&self.state, LoopState::ShuttingDown);
        info!("Controller worker shutting down");
        set_state(&self.state, LoopState::Stopped);
    }
}

fn set_state(sender: &watch::Sender<LoopState>, state: LoopState) {
    let previous = sender.send_replace(state);
    if previous != state {
        debug!(from = ?previous, to = ?state, "Loop state changed");
    }
}
