//! `trellis-dtx` — endpoint middleware for distributed TCC-style
//! participants.
//!
//! All middleware key off the correlation id carried in the
//! [`trellis_core::Context`]; a request without one passes straight
//! through. The backing stores ([`store::Oncer`], [`store::Locker`],
//! [`store::Sequencer`]) have in-memory and Redis implementations.

pub mod middleware;
pub mod propagation;
pub mod store;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use middleware::{DtxError, Endpoint, attempt, cancel, idempotence, lock};
pub use propagation::{CORRELATION_ID_HEADER, extract, inject};
pub use store::{
    Locker, MemoryLocker, MemoryOncer, MemorySequencer, Oncer, Sequencer,
};

#[cfg(feature = "redis")]
pub use redis_store::{RedisLocker, RedisOncer, RedisSequencer};
