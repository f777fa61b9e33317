//! Redis implementations of the middleware stores.
//!
//! Wire use per key, namespaced `(<ns>, correlation_id)`:
//!
//! - once:    GETSET + EXPIRE (a prior value means the id was seen)
//! - lock:    SET NX EX with the context deadline as the lease TTL
//! - markers: scripted pair — SET own marker EX 86400, then EXISTS on the
//!   counterpart

use std::time::Duration;

use trellis_core::Context;

use crate::middleware::DtxError;
use crate::store::{DEFAULT_LOCK_TIMEOUT, Locker, Oncer, Sequencer};

/// Markers outlive any reasonable transaction by a day.
const MARKER_TTL_SECS: u64 = 86_400;

/// Sets our marker, then reports whether the counterpart exists.
/// KEYS = [own marker, counterpart marker].
const MARK_SCRIPT: &str = r#"
redis.call('SET', KEYS[1], '1', 'EX', ARGV[1])
return redis.call('EXISTS', KEYS[2])
"#;

fn storage(err: redis::RedisError) -> DtxError {
    DtxError::Store(err.to_string())
}

/// Redis-backed [`Oncer`].
pub struct RedisOncer {
    client: redis::Client,
    namespace: String,
}

impl RedisOncer {
    pub fn new(client: redis::Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn key(&self, correlation_id: &str) -> String {
        format!("{}:once:{}", self.namespace, correlation_id)
    }
}

impl Oncer for RedisOncer {
    fn once(&self, _ctx: &Context, correlation_id: &str) -> Result<bool, DtxError> {
        let mut conn = self.client.get_connection().map_err(storage)?;

        let (previous,): (Option<String>,) = redis::pipe()
            .cmd("GETSET")
            .arg(self.key(correlation_id))
            .arg("1")
            .cmd("EXPIRE")
            .arg(self.key(correlation_id))
            .arg(MARKER_TTL_SECS)
            .ignore()
            .query(&mut conn)
            .map_err(storage)?;

        Ok(previous.is_some())
    }
}

/// Redis-backed [`Locker`].
pub struct RedisLocker {
    client: redis::Client,
    namespace: String,
}

impl RedisLocker {
    pub fn new(client: redis::Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn key(&self, correlation_id: &str) -> String {
        format!("{}:lock:{}", self.namespace, correlation_id)
    }
}

impl Locker for RedisLocker {
    fn lock(&self, ctx: &Context, correlation_id: &str) -> Result<(), DtxError> {
        let mut conn = self.client.get_connection().map_err(storage)?;

        // The context deadline doubles as the lease TTL so an abandoned
        // lock cannot outlive its transaction.
        let ttl = ctx.remaining().unwrap_or(DEFAULT_LOCK_TIMEOUT);
        let ttl_secs = ttl.as_secs().max(1);

        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(self.key(correlation_id))
                .arg("1")
                .arg("NX")
                .arg("EX")
                .arg(ttl_secs)
                .query(&mut conn)
                .map_err(storage)?;
            if acquired.is_some() {
                return Ok(());
            }

            if ctx.sleep(Duration::from_millis(100)).is_err() {
                return Err(DtxError::NoLock(correlation_id.to_string()));
            }
        }
    }

    fn unlock(&self, _ctx: &Context, correlation_id: &str) -> Result<(), DtxError> {
        let mut conn = self.client.get_connection().map_err(storage)?;
        let _: i64 = redis::cmd("DEL")
            .arg(self.key(correlation_id))
            .query(&mut conn)
            .map_err(storage)?;
        Ok(())
    }
}

/// Redis-backed [`Sequencer`].
pub struct RedisSequencer {
    client: redis::Client,
    namespace: String,
    mark: redis::Script,
}

impl RedisSequencer {
    pub fn new(client: redis::Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            mark: redis::Script::new(MARK_SCRIPT),
        }
    }

    fn attempt_key(&self, correlation_id: &str) -> String {
        format!("{}:attempt:{}", self.namespace, correlation_id)
    }

    fn cancel_key(&self, correlation_id: &str) -> String {
        format!("{}:cancel:{}", self.namespace, correlation_id)
    }

    fn mark(
        &self,
        own_key: String,
        counterpart_key: String,
    ) -> Result<bool, DtxError> {
        let mut conn = self.client.get_connection().map_err(storage)?;
        let counterpart_exists: i64 = self
            .mark
            .key(own_key)
            .key(counterpart_key)
            .arg(MARKER_TTL_SECS)
            .invoke(&mut conn)
            .map_err(storage)?;
        Ok(counterpart_exists == 1)
    }
}

impl Sequencer for RedisSequencer {
    fn mark_attempted_check_cancelled(
        &self,
        _ctx: &Context,
        correlation_id: &str,
    ) -> Result<bool, DtxError> {
        self.mark(
            self.attempt_key(correlation_id),
            self.cancel_key(correlation_id),
        )
    }

    fn mark_cancelled_check_attempted(
        &self,
        _ctx: &Context,
        correlation_id: &str,
    ) -> Result<bool, DtxError> {
        self.mark(
            self.cancel_key(correlation_id),
            self.attempt_key(correlation_id),
        )
    }
}
