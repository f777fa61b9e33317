//! Lease-based election driver.
//!
//! Each candidate polls the lease store for a session key under
//! `<prefix>/leader-election/`; the holder renews at a third of the TTL
//! and loses leadership when a renewal is refused. `resign` releases the
//! lease; the campaign loop then stays out for a full TTL so another
//! candidate takes over before this one re-enters.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use trellis_core::Context;

use crate::driver::{ElectionDriver, ElectionError, LeaseStore};

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Leadership is lost if the lease is not renewed within this window.
    pub lease_ttl: Duration,
    /// Pause between acquisition attempts by non-leaders.
    pub retry_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(15),
            retry_interval: Duration::from_secs(1),
        }
    }
}

impl LeaseConfig {
    /// TTL from `LEADER_LEASE_TTL_MS`, defaulting to 15s.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ttl_ms) = std::env::var("LEADER_LEASE_TTL_MS")
            .ok()
            .and_then(|value| value.parse().ok())
        {
            config.lease_ttl = Duration::from_millis(ttl_ms);
        }
        config
    }
}

enum HoldEnd {
    Lost,
    Resigned,
    Cancelled,
}

/// [`ElectionDriver`] over a [`LeaseStore`].
pub struct LeaseElectionDriver {
    store: Arc<dyn LeaseStore>,
    key: String,
    candidate_id: String,
    config: LeaseConfig,
    resigned: AtomicBool,
}

impl LeaseElectionDriver {
    /// `prefix` namespaces deployments; `election` names the contested
    /// role; `candidate_id` identifies this node.
    pub fn new(
        store: Arc<dyn LeaseStore>,
        prefix: &str,
        election: &str,
        candidate_id: impl Into<String>,
        config: LeaseConfig,
    ) -> Self {
        Self {
            store,
            key: format!("{prefix}/leader-election/{election}"),
            candidate_id: candidate_id.into(),
            config,
            resigned: AtomicBool::new(false),
        }
    }

    pub fn candidate_id(&self) -> &str {
        &self.candidate_id
    }

    /// Renew until the lease is lost, resigned, or the context dies.
    fn hold(&self, ctx: &Context) -> Result<HoldEnd, ElectionError> {
        let renew_interval = self.config.lease_ttl / 3;

        loop {
            if ctx.sleep(renew_interval).is_err() {
                // Shutting down; release so a peer can take over promptly.
                let _ = self
                    .store
                    .release(&Context::background(), &self.key, &self.candidate_id);
                return Ok(HoldEnd::Cancelled);
            }

            if self.resigned.load(Ordering::SeqCst) {
                return Ok(HoldEnd::Resigned);
            }

            match self
                .store
                .renew(ctx, &self.key, &self.candidate_id, self.config.lease_ttl)
            {
                Ok(true) => {
                    debug!(candidate = %self.candidate_id, key = %self.key, "lease renewed");
                }
                Ok(false) => {
                    warn!(candidate = %self.candidate_id, key = %self.key, "lease lost");
                    return Ok(HoldEnd::Lost);
                }
                Err(error) => return Err(error),
            }
        }
    }
}

impl ElectionDriver for LeaseElectionDriver {
    fn campaign(
        &self,
        ctx: &Context,
        on_state_change: &(dyn Fn(bool) + Sync),
    ) -> Result<(), ElectionError> {
        loop {
            if ctx.err().is_err() {
                return Ok(());
            }

            match self
                .store
                .acquire(ctx, &self.key, &self.candidate_id, self.config.lease_ttl)
            {
                Ok(true) => {
                    self.resigned.store(false, Ordering::SeqCst);
                    info!(candidate = %self.candidate_id, key = %self.key, "acquired leadership");
                    on_state_change(true);

                    let end = self.hold(ctx);
                    info!(candidate = %self.candidate_id, key = %self.key, "leadership ended");
                    on_state_change(false);

                    match end? {
                        HoldEnd::Cancelled => return Ok(()),
                        HoldEnd::Resigned => {
                            // Stay out for a full TTL so a waiting peer
                            // wins the vacated lease.
                            if ctx.sleep(self.config.lease_ttl).is_err() {
                                return Ok(());
                            }
                            continue;
                        }
                        HoldEnd::Lost => {}
                    }
                }
                Ok(false) => {
                    debug!(candidate = %self.candidate_id, key = %self.key, "lease held elsewhere");
                }
                Err(error) => return Err(error),
            }

            if ctx.sleep(self.config.retry_interval).is_err() {
                return Ok(());
            }
        }
    }

    fn resign(&self, ctx: &Context) -> Result<(), ElectionError> {
        self.resigned.store(true, Ordering::SeqCst);
        self.store.release(ctx, &self.key, &self.candidate_id)
    }
}
