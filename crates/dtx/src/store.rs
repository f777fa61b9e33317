//! Backing stores for the distributed-transaction middleware.

use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use trellis_core::Context;

use crate::middleware::DtxError;

/// Lock lease/blocking bound when the context carries no deadline.
pub(crate) const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Once-only tracking per correlation id.
pub trait Oncer: Send + Sync {
    /// Record the id. Returns true if it was already seen.
    fn once(&self, ctx: &Context, correlation_id: &str) -> Result<bool, DtxError>;
}

/// Mutual exclusion per correlation id.
pub trait Locker: Send + Sync {
    /// Blocking acquire, bounded by the context deadline (or a one-minute
    /// default). Fails with [`DtxError::NoLock`] when the bound is hit.
    fn lock(&self, ctx: &Context, correlation_id: &str) -> Result<(), DtxError>;

    fn unlock(&self, ctx: &Context, correlation_id: &str) -> Result<(), DtxError>;
}

/// Attempt/cancel marker pair per correlation id.
///
/// Each call sets its own marker and reports whether the counterpart
/// marker exists.
pub trait Sequencer: Send + Sync {
    /// Set the attempted marker; true iff the cancelled marker exists.
    fn mark_attempted_check_cancelled(
        &self,
        ctx: &Context,
        correlation_id: &str,
    ) -> Result<bool, DtxError>;

    /// Set the cancelled marker; true iff the attempted marker exists.
    fn mark_cancelled_check_attempted(
        &self,
        ctx: &Context,
        correlation_id: &str,
    ) -> Result<bool, DtxError>;
}

/// In-memory [`Oncer`] for tests/dev.
#[derive(Debug, Default)]
pub struct MemoryOncer {
    seen: Mutex<HashSet<String>>,
}

impl MemoryOncer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Oncer for MemoryOncer {
    fn once(&self, _ctx: &Context, correlation_id: &str) -> Result<bool, DtxError> {
        let mut seen = self.seen.lock().unwrap();
        Ok(!seen.insert(correlation_id.to_string()))
    }
}

/// In-memory [`Locker`] for tests/dev.
#[derive(Debug, Default)]
pub struct MemoryLocker {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Locker for MemoryLocker {
    fn lock(&self, ctx: &Context, correlation_id: &str) -> Result<(), DtxError> {
        let deadline = Instant::now() + ctx.remaining().unwrap_or(DEFAULT_LOCK_TIMEOUT);
        let mut held = self.held.lock().unwrap();

        loop {
            if held.insert(correlation_id.to_string()) {
                return Ok(());
            }
            let now = Instant::now();
            if ctx.is_cancelled() || now >= deadline {
                return Err(DtxError::NoLock(correlation_id.to_string()));
            }
            let wait = (deadline - now).min(Duration::from_millis(50));
            let (guard, _) = self.released.wait_timeout(held, wait).unwrap();
            held = guard;
        }
    }

    fn unlock(&self, _ctx: &Context, correlation_id: &str) -> Result<(), DtxError> {
        let mut held = self.held.lock().unwrap();
        held.remove(correlation_id);
        self.released.notify_all();
        Ok(())
    }
}

/// In-memory [`Sequencer`] for tests/dev.
#[derive(Debug, Default)]
pub struct MemorySequencer {
    markers: Mutex<HashMap<String, (bool, bool)>>,
}

impl MemorySequencer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Sequencer for MemorySequencer {
    fn mark_attempted_check_cancelled(
        &self,
        _ctx: &Context,
        correlation_id: &str,
    ) -> Result<bool, DtxError> {
        let mut markers = self.markers.lock().unwrap();
        let entry = markers.entry(correlation_id.to_string()).or_default();
        entry.0 = true;
        Ok(entry.1)
    }

    fn mark_cancelled_check_attempted(
        &self,
        _ctx: &Context,
        correlation_id: &str,
    ) -> Result<bool, DtxError> {
        let mut markers = self.markers.lock().unwrap();
        let entry = markers.entry(correlation_id.to_string()).or_default();
        entry.1 = true;
        Ok(entry.0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn oncer_reports_repeats() {
        let ctx = Context::background();
        let oncer = MemoryOncer::new();

        assert!(!oncer.once(&ctx, "tx-1").unwrap());
        assert!(oncer.once(&ctx, "tx-1").unwrap());
        assert!(!oncer.once(&ctx, "tx-2").unwrap());
    }

    #[test]
    fn locker_blocks_until_released() {
        let locker = Arc::new(MemoryLocker::new());
        let ctx = Context::background();

        locker.lock(&ctx, "tx-1").unwrap();

        let contender = {
            let locker = locker.clone();
            thread::spawn(move || {
                let ctx = Context::background().with_timeout(Duration::from_secs(2));
                let started = Instant::now();
                locker.lock(&ctx, "tx-1").unwrap();
                started.elapsed()
            })
        };

        thread::sleep(Duration::from_millis(50));
        locker.unlock(&ctx, "tx-1").unwrap();

        let waited = contender.join().unwrap();
        assert!(waited >= Duration::from_millis(40));
        assert!(waited < Duration::from_secs(2));
    }

    #[test]
    fn locker_times_out_on_deadline() {
        let locker = MemoryLocker::new();
        let ctx = Context::background();

        locker.lock(&ctx, "tx-1").unwrap();

        let bounded = Context::background().with_timeout(Duration::from_millis(80));
        assert!(matches!(
            locker.lock(&bounded, "tx-1"),
            Err(DtxError::NoLock(_))
        ));
    }

    #[test]
    fn sequencer_markers_see_each_other() {
        let ctx = Context::background();
        let sequencer = MemorySequencer::new();

        // Attempt first: no cancel marker yet.
        assert!(!sequencer.mark_attempted_check_cancelled(&ctx, "tx-1").unwrap());
        // Cancel afterwards sees the attempt.
        assert!(sequencer.mark_cancelled_check_attempted(&ctx, "tx-1").unwrap());
        // A late attempt sees the cancel.
        assert!(sequencer.mark_attempted_check_cancelled(&ctx, "tx-1").unwrap());
    }

    #[test]
    fn cancel_first_reports_no_attempt() {
        let ctx = Context::background();
        let sequencer = MemorySequencer::new();

        assert!(!sequencer.mark_cancelled_check_attempted(&ctx, "tx-9").unwrap());
    }
}
