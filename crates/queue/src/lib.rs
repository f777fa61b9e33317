//! `trellis-queue` — in-process event bus with a persistent, delayed,
//! retrying work queue behind it.
//!
//! Transient events fan out synchronously to subscribed listeners.
//! Persistent events are serialized and handed to a [`driver::Driver`]
//! (Redis in production, in-process for tests/dev); a fixed pool of worker
//! threads pops them back, invokes listeners inside a timeout budget, and
//! acks, retries with jittered back-off, or dead-letters based on outcome.

pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod event;
pub mod factory;
pub mod metrics;

pub use config::QueueConfig;
pub use dispatcher::{
    ABORTED_EVENT, Dispatch, DispatchError, Dispatcher, Listener, ListenerError, RETRYING_EVENT,
    SystemEventPayload, default_dispatcher, set_default_dispatcher,
};
pub use driver::memory::MemoryDriver;
pub use driver::{Channel, Driver, DriverError, QueueInfo};
pub use event::{Event, Persist, PersistedEvent, persist};
pub use factory::{CONFIG_RELOADED_EVENT, ConfigReloadListener, DispatcherFactory};
pub use metrics::{Gauge, QueueLengthReporter};

#[cfg(feature = "redis")]
pub use driver::redis::RedisDriver;
