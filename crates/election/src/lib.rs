//! `trellis-election` — single-leader coordination.
//!
//! An [`driver::ElectionDriver`] is the abstract primitive: `campaign`
//! blocks and reports leadership transitions, `resign` releases. The
//! shipped implementation is [`lease::LeaseElectionDriver`] over a
//! [`driver::LeaseStore`] (session key under a leader-election prefix,
//! TTL renewal, loss detection); stores exist for Redis and in-process
//! use. The [`controller::Controller`] wraps a driver, owns the atomic
//! `is_leader` flag, and publishes transitions as ordinary dispatcher
//! events.

pub mod controller;
pub mod driver;
pub mod lease;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use controller::{Controller, STATUS_CHANGED_EVENT, StatusChanged};
pub use driver::{ElectionDriver, ElectionError, LeaseStore, MemoryLeaseStore};
pub use lease::{LeaseConfig, LeaseElectionDriver};

#[cfg(feature = "redis")]
pub use redis_store::RedisLeaseStore;
