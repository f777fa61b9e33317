//! Redis-backed queue driver.
//!
//! Channel layout on the wire:
//!
//! - `waiting`, `timeout`, `failed` — lists (LPUSH / BRPOP / RPOPLPUSH)
//! - `delayed` — sorted set, score = unix-seconds ready time
//! - `reserved` — sorted set, score = unix-seconds lease deadline
//!
//! Keys are templated `{<app>:<env>:<queue>}:<channel>`; the curly-brace
//! hash tag keeps all five channels in one slot on clustered deployments,
//! which the promotion scripts require.
//!
//! The promote steps run as Lua scripts and `fail`/`retry` as MULTI
//! pipelines, so moves stay atomic with respect to other drivers sharing
//! the same storage.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use trellis_core::Context;

use crate::backoff;
use crate::event::PersistedEvent;

use super::{Channel, Driver, DriverError, MAX_PROMOTIONS_PER_POP, QueueInfo, reloadable};

/// Moves due members of a sorted set onto a list. KEYS = [zset, list],
/// ARGV = [max score, batch limit].
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, member in ipairs(due) do
  redis.call('LPUSH', KEYS[2], member)
  redis.call('ZREM', KEYS[1], member)
end
return #due
"#;

/// Redis-backed [`Driver`].
pub struct RedisDriver {
    client: redis::Client,
    key_prefix: String,
    pop_timeout: Duration,
    promote: redis::Script,
    closed: AtomicBool,
}

impl RedisDriver {
    /// `app` and `env` namespace the queue; `queue` is the instance name.
    pub fn new(
        client: redis::Client,
        app: &str,
        env: &str,
        queue: &str,
        pop_timeout: Duration,
    ) -> Self {
        Self {
            client,
            key_prefix: format!("{{{app}:{env}:{queue}}}"),
            pop_timeout,
            promote: redis::Script::new(PROMOTE_SCRIPT),
            closed: AtomicBool::new(false),
        }
    }

    pub fn open(
        url: &str,
        app: &str,
        env: &str,
        queue: &str,
        pop_timeout: Duration,
    ) -> Result<Self, DriverError> {
        let client = redis::Client::open(url).map_err(storage)?;
        Ok(Self::new(client, app, env, queue, pop_timeout))
    }

    fn key(&self, channel: Channel) -> String {
        format!("{}:{}", self.key_prefix, channel)
    }

    fn conn(&self) -> Result<redis::Connection, DriverError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Closed);
        }
        self.client.get_connection().map_err(storage)
    }

    fn promote_due(&self, conn: &mut redis::Connection) -> Result<(), DriverError> {
        let now = unix_now();

        let promoted: i64 = self
            .promote
            .key(self.key(Channel::Delayed))
            .key(self.key(Channel::Waiting))
            .arg(now)
            .arg(MAX_PROMOTIONS_PER_POP)
            .invoke(conn)
            .map_err(storage)?;
        if promoted > 0 {
            debug!(promoted, "promoted delayed events to waiting");
        }

        let expired: i64 = self
            .promote
            .key(self.key(Channel::Reserved))
            .key(self.key(Channel::Timeout))
            .arg(now)
            .arg(MAX_PROMOTIONS_PER_POP)
            .invoke(conn)
            .map_err(storage)?;
        if expired > 0 {
            debug!(expired, "moved expired reservations to timeout");
        }

        Ok(())
    }
}

impl Driver for RedisDriver {
    fn push(
        &self,
        ctx: &Context,
        event: PersistedEvent,
        delay: Duration,
    ) -> Result<(), DriverError> {
        ctx.err().map_err(interrupted)?;
        let mut conn = self.conn()?;
        let member = serialize(&event)?;

        if delay.is_zero() {
            let _: i64 = redis::cmd("LPUSH")
                .arg(self.key(Channel::Waiting))
                .arg(member)
                .query(&mut conn)
                .map_err(storage)?;
        } else {
            let ready_at = unix_now() + delay.as_secs_f64();
            let _: i64 = redis::cmd("ZADD")
                .arg(self.key(Channel::Delayed))
                .arg(ready_at)
                .arg(member)
                .query(&mut conn)
                .map_err(storage)?;
        }
        Ok(())
    }

    fn pop(&self, ctx: &Context) -> Result<PersistedEvent, DriverError> {
        ctx.err().map_err(interrupted)?;
        let mut conn = self.conn()?;

        self.promote_due(&mut conn)?;

        let mut timeout = self.pop_timeout;
        if let Some(remaining) = ctx.remaining() {
            timeout = timeout.min(remaining);
        }
        if timeout.is_zero() {
            return Err(DriverError::Empty);
        }

        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(self.key(Channel::Waiting))
            .arg(timeout.as_secs_f64())
            .query(&mut conn)
            .map_err(storage)?;

        let Some((_, member)) = popped else {
            return Err(DriverError::Empty);
        };

        let event = deserialize(&member)?;
        let deadline = unix_now() + event.handle_timeout.as_secs_f64();
        let _: i64 = redis::cmd("ZADD")
            .arg(self.key(Channel::Reserved))
            .arg(deadline)
            .arg(member)
            .query(&mut conn)
            .map_err(storage)?;

        Ok(event)
    }

    fn ack(&self, ctx: &Context, event: &PersistedEvent) -> Result<(), DriverError> {
        ctx.err().map_err(interrupted)?;
        let mut conn = self.conn()?;

        let _: i64 = redis::cmd("ZREM")
            .arg(self.key(Channel::Reserved))
            .arg(serialize(event)?)
            .query(&mut conn)
            .map_err(storage)?;
        Ok(())
    }

    fn fail(&self, ctx: &Context, event: &PersistedEvent) -> Result<(), DriverError> {
        ctx.err().map_err(interrupted)?;
        let mut conn = self.conn()?;

        let mut failed = event.clone();
        failed.attempts += 1;

        let _: () = redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(self.key(Channel::Reserved))
            .arg(serialize(event)?)
            .ignore()
            .cmd("LPUSH")
            .arg(self.key(Channel::Failed))
            .arg(serialize(&failed)?)
            .ignore()
            .query(&mut conn)
            .map_err(storage)?;
        Ok(())
    }

    fn retry(&self, ctx: &Context, event: &PersistedEvent) -> Result<(), DriverError> {
        ctx.err().map_err(interrupted)?;
        let mut conn = self.conn()?;

        let mut retried = event.clone();
        retried.backoff = backoff::next(event.backoff);
        retried.attempts += 1;
        let ready_at = unix_now() + retried.backoff.as_secs_f64();

        let _: () = redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(self.key(Channel::Reserved))
            .arg(serialize(event)?)
            .ignore()
            .cmd("ZADD")
            .arg(self.key(Channel::Delayed))
            .arg(ready_at)
            .arg(serialize(&retried)?)
            .ignore()
            .query(&mut conn)
            .map_err(storage)?;
        Ok(())
    }

    fn reload(&self, ctx: &Context, channel: Channel) -> Result<u64, DriverError> {
        reloadable(channel)?;
        ctx.err().map_err(interrupted)?;
        let mut conn = self.conn()?;

        let source = self.key(channel);
        let target = self.key(Channel::Waiting);
        let mut moved = 0u64;
        loop {
            let member: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(&source)
                .arg(&target)
                .query(&mut conn)
                .map_err(storage)?;
            if member.is_none() {
                return Ok(moved);
            }
            moved += 1;
        }
    }

    fn flush(&self, ctx: &Context, channel: Channel) -> Result<(), DriverError> {
        ctx.err().map_err(interrupted)?;
        let mut conn = self.conn()?;

        let _: i64 = redis::cmd("DEL")
            .arg(self.key(channel))
            .query(&mut conn)
            .map_err(storage)?;
        Ok(())
    }

    fn info(&self, ctx: &Context) -> Result<QueueInfo, DriverError> {
        ctx.err().map_err(interrupted)?;
        let mut conn = self.conn()?;

        let (waiting, delayed, reserved, timeout, failed): (u64, u64, u64, u64, u64) =
            redis::pipe()
                .cmd("LLEN")
                .arg(self.key(Channel::Waiting))
                .cmd("ZCARD")
                .arg(self.key(Channel::Delayed))
                .cmd("ZCARD")
                .arg(self.key(Channel::Reserved))
                .cmd("LLEN")
                .arg(self.key(Channel::Timeout))
                .cmd("LLEN")
                .arg(self.key(Channel::Failed))
                .query(&mut conn)
                .map_err(storage)?;

        Ok(QueueInfo {
            waiting,
            delayed,
            reserved,
            timeout,
            failed,
        })
    }

    fn close(&self) -> Result<(), DriverError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn unix_now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

fn storage(err: redis::RedisError) -> DriverError {
    DriverError::Storage(err.to_string())
}

fn interrupted(err: trellis_core::ContextError) -> DriverError {
    DriverError::Storage(err.to_string())
}

/// The serialized form doubles as the channel member, so it must be
/// byte-stable across a round trip for ack/fail/retry to find the exact
/// reserved entry.
fn serialize(event: &PersistedEvent) -> Result<String, DriverError> {
    serde_json::to_string(event).map_err(|e| DriverError::Storage(e.to_string()))
}

fn deserialize(member: &str) -> Result<PersistedEvent, DriverError> {
    serde_json::from_str(member).map_err(|e| DriverError::Storage(e.to_string()))
}
