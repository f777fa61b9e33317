//! Crash recovery for saga sessions.
//!
//! Enumerates uncommitted, stale sessions from the log store and
//! compensates their executed-but-unacknowledged steps (reverse step
//! order, null requests — compensations are null-tolerant by contract).
//! Runs once at startup and then on a ticker, gated on the leadership
//! flag so only one node in the cluster sweeps.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use trellis_core::{Context, CorrelationId};

use crate::coordinator::Registry;
use crate::log::{SagaLogEntry, SagaLogError};

/// Periodic recovery sweeper.
pub struct Recovery {
    registry: Arc<Registry>,
    interval: Duration,
    is_leader: Arc<AtomicBool>,
}

impl Recovery {
    pub fn new(registry: Arc<Registry>, interval: Duration) -> Self {
        Self {
            registry,
            interval,
            // Ungated by default; single-node deployments have no election.
            is_leader: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Interval from `SAGA_RECOVER_INTERVAL_SECS`, defaulting to 60s.
    pub fn from_env(registry: Arc<Registry>) -> Self {
        let interval = std::env::var("SAGA_RECOVER_INTERVAL_SECS")
            .ok()
            .and_then(|value| value.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(60));
        Self::new(registry, interval)
    }

    /// Gate sweeps on a leadership flag owned by an election controller.
    pub fn gated_on(mut self, is_leader: Arc<AtomicBool>) -> Self {
        self.is_leader = is_leader;
        self
    }

    /// Sweep once. Returns the number of steps compensated.
    pub fn recover(&self, ctx: &Context) -> Result<usize, SagaLogError> {
        let store = self.registry.store().clone();
        let sessions = store.uncommitted_sessions()?;
        let mut compensated = 0;

        for session in sessions {
            let Some(saga) = self.registry.get(&session.saga_name) else {
                warn!(
                    saga = %session.saga_name,
                    correlation_id = %session.correlation_id,
                    "uncommitted session references an unregistered saga, skipping"
                );
                continue;
            };

            let steps = store.unacknowledged_steps(&session.correlation_id)?;
            if steps.is_empty() {
                continue;
            }

            info!(
                saga = %session.saga_name,
                correlation_id = %session.correlation_id,
                steps = steps.len(),
                "recovering saga session"
            );

            let session_ctx =
                ctx.with_correlation_id(CorrelationId::from(session.correlation_id.clone()));

            for executed in steps {
                let Some(step) = saga.step_by_number(executed.step_number) else {
                    warn!(
                        saga = %session.saga_name,
                        step_number = executed.step_number,
                        "executed step is not part of the registered saga, skipping"
                    );
                    continue;
                };

                let mut entry = SagaLogEntry::compensated(
                    &executed.correlation_id,
                    &executed.saga_name,
                    executed.step_number,
                    &executed.step_name,
                );
                store.log(entry.clone())?;

                // The original request died with the crashed process;
                // compensations tolerate a null request.
                let result = (step.compensate())(&session_ctx, &JsonValue::Null);

                entry.finish(result.as_ref().err().map(|e| e.0.clone()));
                store.ack(&entry)?;

                match result {
                    Ok(()) => compensated += 1,
                    Err(error) => warn!(
                        correlation_id = %executed.correlation_id,
                        step = %executed.step_name,
                        error = %error,
                        "recovery compensation failed"
                    ),
                }
            }
        }

        Ok(compensated)
    }

    /// Run one immediate sweep, then sweep on every tick while the
    /// leadership flag is set. Returns a handle for graceful shutdown.
    pub fn spawn(self) -> RecoveryHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name("saga-recovery".to_string())
            .spawn(move || {
                let ctx = Context::background();
                self.tick(&ctx);

                loop {
                    match shutdown_rx.recv_timeout(self.interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => self.tick(&ctx),
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
                    }
                }
            })
            .expect("failed to spawn saga recovery thread");

        RecoveryHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }

    fn tick(&self, ctx: &Context) {
        if !self.is_leader.load(Ordering::SeqCst) {
            debug!("skipping saga recovery, not the leader");
            return;
        }
        match self.recover(ctx) {
            Ok(0) => {}
            Ok(compensated) => info!(compensated, "saga recovery sweep finished"),
            Err(error) => warn!(error = %error, "saga recovery sweep failed"),
        }
    }
}

/// Handle to stop a running recovery sweeper.
#[derive(Debug)]
pub struct RecoveryHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl RecoveryHandle {
    /// Request graceful shutdown.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
