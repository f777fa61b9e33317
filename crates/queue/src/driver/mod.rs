//! Persistent queue drivers.
//!
//! A driver owns five logical channels and is the only mutator of them:
//!
//! - `waiting`  — FIFO of ready events
//! - `delayed`  — ordered by ready time
//! - `reserved` — ordered by lease deadline
//! - `timeout`  — events whose lease expired before ack
//! - `failed`   — events that exhausted their attempts
//!
//! An event is in exactly one channel at any instant; moves between
//! channels are atomic relative to other observers of the same storage.

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use core::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use trellis_core::Context;

use crate::event::PersistedEvent;

/// How many delayed/reserved entries one `pop` call promotes at most.
pub(crate) const MAX_PROMOTIONS_PER_POP: usize = 128;

/// Logical channel names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Waiting,
    Delayed,
    Reserved,
    Timeout,
    Failed,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Waiting => "waiting",
            Channel::Delayed => "delayed",
            Channel::Reserved => "reserved",
            Channel::Timeout => "timeout",
            Channel::Failed => "failed",
        }
    }
}

impl core::fmt::Display for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Channel::Waiting),
            "delayed" => Ok(Channel::Delayed),
            "reserved" => Ok(Channel::Reserved),
            "timeout" => Ok(Channel::Timeout),
            "failed" => Ok(Channel::Failed),
            other => Err(DriverError::InvalidChannel(other.to_string())),
        }
    }
}

/// Driver failure modes.
///
/// `Empty` is internal flow control (pop timed out with nothing ready);
/// it never reaches user code.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("no event became ready within the pop timeout")]
    Empty,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("driver is closed")]
    Closed,

    #[error("invalid channel: {0}")]
    InvalidChannel(String),

    #[error(transparent)]
    Codec(#[from] trellis_core::CodecError),
}

/// Sizes of the five channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    pub waiting: u64,
    pub delayed: u64,
    pub reserved: u64,
    pub timeout: u64,
    pub failed: u64,
}

/// Persistent channel set with atomic moves.
///
/// All operations accept a [`Context`]; blocking waits return promptly on
/// cancellation. Storage errors propagate; callers may retry transparently.
pub trait Driver: Send + Sync {
    /// Enqueue: ready now if `delay` is zero, otherwise into `delayed`
    /// scored by `now + delay`.
    fn push(
        &self,
        ctx: &Context,
        event: PersistedEvent,
        delay: Duration,
    ) -> Result<(), DriverError>;

    /// Promote due delayed entries to `waiting` and expired reservations to
    /// `timeout`, then block up to the pop timeout for a ready event. The
    /// returned event is leased: it sits in `reserved` until `ack`, `fail`,
    /// or `retry`, and is re-delivered once its lease deadline passes.
    ///
    /// Returns [`DriverError::Empty`] when nothing arrived in time.
    fn pop(&self, ctx: &Context) -> Result<PersistedEvent, DriverError>;

    /// Remove the event from `reserved`. No-op if it is not there.
    fn ack(&self, ctx: &Context, event: &PersistedEvent) -> Result<(), DriverError>;

    /// Atomically move the event from `reserved` to `failed`, bumping
    /// `attempts`.
    fn fail(&self, ctx: &Context, event: &PersistedEvent) -> Result<(), DriverError>;

    /// Atomically move the event from `reserved` back to `delayed` with a
    /// recomputed jittered back-off and bumped `attempts`.
    fn retry(&self, ctx: &Context, event: &PersistedEvent) -> Result<(), DriverError>;

    /// Move every element of `failed` or `timeout` back to `waiting`
    /// without touching attempts. Returns the number moved.
    fn reload(&self, ctx: &Context, channel: Channel) -> Result<u64, DriverError>;

    /// Delete every element of the given channel.
    fn flush(&self, ctx: &Context, channel: Channel) -> Result<(), DriverError>;

    /// Current channel sizes.
    fn info(&self, ctx: &Context) -> Result<QueueInfo, DriverError>;

    /// Release underlying resources; subsequent calls fail with `Closed`.
    fn close(&self) -> Result<(), DriverError>;
}

pub(crate) fn reloadable(channel: Channel) -> Result<(), DriverError> {
    match channel {
        Channel::Failed | Channel::Timeout => Ok(()),
        other => Err(DriverError::InvalidChannel(format!(
            "cannot reload from {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_parses_round_trip() {
        for channel in [
            Channel::Waiting,
            Channel::Delayed,
            Channel::Reserved,
            Channel::Timeout,
            Channel::Failed,
        ] {
            assert_eq!(channel.as_str().parse::<Channel>().unwrap(), channel);
        }
        assert!("bogus".parse::<Channel>().is_err());
    }

    #[test]
    fn reload_is_restricted_to_dead_channels() {
        assert!(reloadable(Channel::Failed).is_ok());
        assert!(reloadable(Channel::Timeout).is_ok());
        assert!(reloadable(Channel::Waiting).is_err());
        assert!(reloadable(Channel::Reserved).is_err());
        assert!(reloadable(Channel::Delayed).is_err());
    }
}
