//! Election driver abstraction and the lease-store seam beneath it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

use trellis_core::Context;

#[derive(Debug, Error)]
pub enum ElectionError {
    #[error("not the leader")]
    NotLeader,

    #[error("store error: {0}")]
    Store(String),
}

/// Abstract single-leader primitive.
pub trait ElectionDriver: Send + Sync {
    /// Participate in the election until the context is cancelled.
    ///
    /// Drives `on_state_change(true)` exactly once per acquisition and
    /// `on_state_change(false)` on each loss. Returns `Ok(())` on
    /// cancellation; a store failure aborts the campaign with an error so
    /// the run-group can restart it.
    fn campaign(
        &self,
        ctx: &Context,
        on_state_change: &(dyn Fn(bool) + Sync),
    ) -> Result<(), ElectionError>;

    /// Release leadership. Idempotent under repeated resign on a
    /// non-leader.
    fn resign(&self, ctx: &Context) -> Result<(), ElectionError>;
}

/// Lease storage: acquire-if-absent with TTL, renewal, release.
///
/// This is where an external session store (Redis here, an etcd session
/// equivalently) plugs in.
pub trait LeaseStore: Send + Sync {
    /// Take the lease if it is vacant or already ours. True on success.
    fn acquire(
        &self,
        ctx: &Context,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, ElectionError>;

    /// Extend the lease if still held by `holder`. False means it was
    /// lost.
    fn renew(
        &self,
        ctx: &Context,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, ElectionError>;

    /// Release the lease if held by `holder`; no-op otherwise.
    fn release(&self, ctx: &Context, key: &str, holder: &str) -> Result<(), ElectionError>;

    /// Current holder, if any lease is live.
    fn holder(&self, ctx: &Context, key: &str) -> Result<Option<String>, ElectionError>;
}

/// In-process lease store. Candidates sharing the same instance elect
/// among themselves; used by tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LeaseStore for MemoryLeaseStore {
    fn acquire(
        &self,
        _ctx: &Context,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, ElectionError> {
        let mut leases = self.leases.lock().unwrap();
        let now = Instant::now();

        match leases.get(key) {
            Some((current, expires_at)) if *expires_at > now && current != holder => Ok(false),
            _ => {
                leases.insert(key.to_string(), (holder.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    fn renew(
        &self,
        _ctx: &Context,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, ElectionError> {
        let mut leases = self.leases.lock().unwrap();
        let now = Instant::now();

        match leases.get_mut(key) {
            Some((current, expires_at)) if *expires_at > now && current == holder => {
                *expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release(&self, _ctx: &Context, key: &str, holder: &str) -> Result<(), ElectionError> {
        let mut leases = self.leases.lock().unwrap();
        if let Some((current, _)) = leases.get(key) {
            if current == holder {
                leases.remove(key);
            }
        }
        Ok(())
    }

    fn holder(&self, _ctx: &Context, key: &str) -> Result<Option<String>, ElectionError> {
        let leases = self.leases.lock().unwrap();
        Ok(leases
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(holder, _)| holder.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_is_exclusive_while_live() {
        let ctx = Context::background();
        let store = MemoryLeaseStore::new();
        let ttl = Duration::from_secs(10);

        assert!(store.acquire(&ctx, "k", "a", ttl).unwrap());
        assert!(!store.acquire(&ctx, "k", "b", ttl).unwrap());
        assert_eq!(store.holder(&ctx, "k").unwrap().as_deref(), Some("a"));

        // Re-acquire by the current holder succeeds.
        assert!(store.acquire(&ctx, "k", "a", ttl).unwrap());
    }

    #[test]
    fn expired_lease_can_be_taken() {
        let ctx = Context::background();
        let store = MemoryLeaseStore::new();

        assert!(store.acquire(&ctx, "k", "a", Duration::from_millis(10)).unwrap());
        std::thread::sleep(Duration::from_millis(30));

        assert!(store.acquire(&ctx, "k", "b", Duration::from_secs(10)).unwrap());
        assert!(!store.renew(&ctx, "k", "a", Duration::from_secs(10)).unwrap());
    }

    #[test]
    fn release_is_holder_scoped() {
        let ctx = Context::background();
        let store = MemoryLeaseStore::new();
        let ttl = Duration::from_secs(10);

        store.acquire(&ctx, "k", "a", ttl).unwrap();
        store.release(&ctx, "k", "b").unwrap();
        assert_eq!(store.holder(&ctx, "k").unwrap().as_deref(), Some("a"));

        store.release(&ctx, "k", "a").unwrap();
        assert!(store.holder(&ctx, "k").unwrap().is_none());

        // Releasing an already-released lease is a no-op.
        store.release(&ctx, "k", "a").unwrap();
    }
}
