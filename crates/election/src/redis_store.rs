//! Redis lease store.
//!
//! Acquire is `SET key holder NX PX ttl`; renew and release are
//! holder-compare scripts so a stale candidate can never extend or drop a
//! lease that moved on.

use std::time::Duration;

use trellis_core::Context;

use crate::driver::{ElectionError, LeaseStore};

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Redis-backed [`LeaseStore`].
pub struct RedisLeaseStore {
    client: redis::Client,
    renew: redis::Script,
    release: redis::Script,
}

impl RedisLeaseStore {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            renew: redis::Script::new(RENEW_SCRIPT),
            release: redis::Script::new(RELEASE_SCRIPT),
        }
    }

    pub fn open(url: &str) -> Result<Self, ElectionError> {
        let client = redis::Client::open(url).map_err(storage)?;
        Ok(Self::new(client))
    }

    fn conn(&self) -> Result<redis::Connection, ElectionError> {
        self.client.get_connection().map_err(storage)
    }
}

impl LeaseStore for RedisLeaseStore {
    fn acquire(
        &self,
        _ctx: &Context,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, ElectionError> {
        let mut conn = self.conn()?;

        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query(&mut conn)
            .map_err(storage)?;
        if set.is_some() {
            return Ok(true);
        }

        // Not vacant; still ours if the holder matches (renew in place).
        let extended: i64 = self
            .renew
            .key(key)
            .arg(holder)
            .arg(ttl.as_millis() as u64)
            .invoke(&mut conn)
            .map_err(storage)?;
        Ok(extended == 1)
    }

    fn renew(
        &self,
        _ctx: &Context,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, ElectionError> {
        let mut conn = self.conn()?;
        let extended: i64 = self
            .renew
            .key(key)
            .arg(holder)
            .arg(ttl.as_millis() as u64)
            .invoke(&mut conn)
            .map_err(storage)?;
        Ok(extended == 1)
    }

    fn release(&self, _ctx: &Context, key: &str, holder: &str) -> Result<(), ElectionError> {
        let mut conn = self.conn()?;
        let _: i64 = self
            .release
            .key(key)
            .arg(holder)
            .invoke(&mut conn)
            .map_err(storage)?;
        Ok(())
    }

    fn holder(&self, _ctx: &Context, key: &str) -> Result<Option<String>, ElectionError> {
        let mut conn = self.conn()?;
        redis::cmd("GET").arg(key).query(&mut conn).map_err(storage)
    }
}

fn storage(err: redis::RedisError) -> ElectionError {
    ElectionError::Store(err.to_string())
}
