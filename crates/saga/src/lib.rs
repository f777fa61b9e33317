//! `trellis-saga` — long-running multi-step transactions with
//! compensation, a persistent session log, and recovery on restart.
//!
//! A [`coordinator::Registry`] holds saga definitions. `start_tx` opens a
//! session keyed by a correlation id; each executed step and each
//! compensation is persisted through a [`log::SagaLogStore`] before and
//! after it runs, so a crashed process can be swept by
//! [`recovery::Recovery`]: uncommitted, stale sessions get their
//! executed-but-unacknowledged steps compensated in reverse step order.

pub mod coordinator;
pub mod log;
pub mod recovery;

#[cfg(feature = "redis")]
pub mod redis_log;

pub use coordinator::{
    CoordinatorError, Registry, Saga, SagaError, Step, StepError, Transaction,
    default_saga_timeout,
};
pub use log::{MemorySagaLogStore, SagaLogEntry, SagaLogError, SagaLogStore, SagaLogType};
pub use recovery::{Recovery, RecoveryHandle};

#[cfg(feature = "redis")]
pub use redis_log::RedisSagaLogStore;
