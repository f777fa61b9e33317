//! Queueable event dispatcher.
//!
//! Transient events fan out synchronously, in registration order, aborting
//! on the first listener error. Persistent events are serialized and pushed
//! to the driver; [`Dispatcher::consume`] runs the worker pool that pops
//! them back and invokes listeners inside the event's timeout budget.
//!
//! Listener failures never crash a worker: they are routed to retry (with
//! jittered back-off) or to the `failed` channel, and the transient
//! `queue.retrying` / `queue.aborted` system events let application code
//! observe both edges. Panics at the listener boundary are converted into
//! listener errors.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock, RwLock};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use trellis_core::{Codec, CodecError, Context, ContextError, JsonCodec};

use crate::driver::{Driver, DriverError};
use crate::event::{Event, Persist, PersistedEvent};

/// System event emitted before a failed event is re-queued.
pub const RETRYING_EVENT: &str = "queue.retrying";

/// System event emitted when an event reaches its retry ceiling or trips
/// its handling deadline.
pub const ABORTED_EVENT: &str = "queue.aborted";

/// How long a worker backs off after a storage error before the next tick.
const STORAGE_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Payload of the `queue.retrying` and `queue.aborted` system events:
/// the original durable event plus the last listener error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEventPayload {
    pub event: PersistedEvent,
    pub error: String,
}

/// Error returned by a listener. Panics at the listener boundary are
/// converted into this.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ListenerError(pub String);

impl ListenerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for ListenerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for ListenerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// An event consumer declaring the event types it handles.
pub trait Listener: Send + Sync {
    /// Event type tags this listener consumes.
    fn listen(&self) -> Vec<String>;

    fn handle(&self, ctx: &Context, event: &Event) -> Result<(), ListenerError>;
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("listener failed: {0}")]
    Listener(#[from] ListenerError),
}

/// What `dispatch` accepts: a bare [`Event`] routes synchronously, a
/// [`Persist`]-wrapped one goes through the driver.
pub enum Dispatch {
    Transient(Event),
    Persistent(Persist),
}

impl From<Event> for Dispatch {
    fn from(event: Event) -> Self {
        Dispatch::Transient(event)
    }
}

impl From<Persist> for Dispatch {
    fn from(persist: Persist) -> Self {
        Dispatch::Persistent(persist)
    }
}

/// In-process pub/sub with optional persistence behind a queue driver.
pub struct Dispatcher {
    name: String,
    driver: Arc<dyn Driver>,
    codec: Arc<dyn Codec>,
    parallelism: usize,
    listeners: RwLock<HashMap<String, Vec<Arc<dyn Listener>>>>,
}

impl Dispatcher {
    pub fn new(name: impl Into<String>, driver: Arc<dyn Driver>) -> Self {
        Self {
            name: name.into(),
            driver,
            codec: Arc::new(JsonCodec),
            parallelism: num_cpus::get(),
            listeners: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Worker pool size for [`Dispatcher::consume`].
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Register a listener for every event type it declares.
    ///
    /// Listeners run in registration order per event type.
    pub fn subscribe(&self, listener: Arc<dyn Listener>) {
        let mut table = self.listeners.write().unwrap();
        for key in listener.listen() {
            table.entry(key).or_default().push(listener.clone());
        }
    }

    /// Route an event: transient events fan out synchronously (first
    /// listener error aborts and is returned); persistent events are
    /// serialized and pushed to the driver with their requested delay.
    pub fn dispatch(&self, ctx: &Context, event: impl Into<Dispatch>) -> Result<(), DispatchError> {
        match event.into() {
            Dispatch::Transient(event) => self.fan_out(ctx, &event).map_err(DispatchError::from),
            Dispatch::Persistent(persist) => {
                let (persisted, delay) = persist.into_persisted(self.codec.as_ref())?;
                debug!(
                    queue = %self.name,
                    key = %persisted.key,
                    unique_id = %persisted.unique_id,
                    delay_ms = delay.as_millis() as u64,
                    "persisting event"
                );
                self.driver.push(ctx, persisted, delay)?;
                Ok(())
            }
        }
    }

    /// Run the worker pool until the context is cancelled.
    pub fn consume(&self, ctx: &Context) {
        info!(queue = %self.name, workers = self.parallelism, "dispatcher consuming");

        thread::scope(|scope| {
            for index in 0..self.parallelism {
                let name = format!("{}-worker-{}", self.name, index);
                thread::Builder::new()
                    .name(name)
                    .spawn_scoped(scope, || self.worker_loop(ctx))
                    .expect("failed to spawn queue worker thread");
            }
        });

        info!(queue = %self.name, "dispatcher stopped");
    }

    fn worker_loop(&self, ctx: &Context) {
        loop {
            if ctx.err().is_err() {
                return;
            }

            match self.driver.pop(ctx) {
                Ok(event) => self.process(ctx, event),
                Err(DriverError::Empty) => continue,
                Err(DriverError::Closed) => return,
                Err(err) => {
                    warn!(queue = %self.name, error = %err, "pop failed");
                    let _ = ctx.sleep(STORAGE_ERROR_PAUSE);
                }
            }
        }
    }

    fn process(&self, ctx: &Context, persisted: PersistedEvent) {
        let data = match self.codec.unmarshal(&persisted.value) {
            Ok(data) => data,
            Err(err) => {
                // Undecodable payloads can never succeed; dead-letter them.
                warn!(
                    queue = %self.name,
                    unique_id = %persisted.unique_id,
                    error = %err,
                    "event payload failed to decode"
                );
                self.abort(ctx, &persisted, err.to_string());
                return;
            }
        };
        let event = Event::from_value(persisted.key.clone(), data);

        let invocation_ctx = ctx.with_timeout(persisted.handle_timeout);
        let outcome = self.invoke_all(&invocation_ctx, &event);

        match outcome {
            Ok(()) => {
                if let Err(err) = self.driver.ack(ctx, &persisted) {
                    // The reservation deadline scan will recover it.
                    error!(
                        queue = %self.name,
                        unique_id = %persisted.unique_id,
                        error = %err,
                        "ack failed"
                    );
                }
            }
            Err(Invocation::DeadlineTripped) => {
                self.abort(ctx, &persisted, "handle timeout exceeded".to_string());
            }
            Err(Invocation::Listener(err)) => {
                if persisted.attempts < persisted.max_attempts {
                    self.emit_system(ctx, RETRYING_EVENT, &persisted, &err.0);
                    if let Err(driver_err) = self.driver.retry(ctx, &persisted) {
                        error!(
                            queue = %self.name,
                            unique_id = %persisted.unique_id,
                            error = %driver_err,
                            "retry failed"
                        );
                    }
                } else {
                    self.abort(ctx, &persisted, err.0);
                }
            }
        }
    }

    fn abort(&self, ctx: &Context, persisted: &PersistedEvent, reason: String) {
        self.emit_system(ctx, ABORTED_EVENT, persisted, &reason);
        if let Err(err) = self.driver.fail(ctx, persisted) {
            error!(
                queue = %self.name,
                unique_id = %persisted.unique_id,
                error = %err,
                "fail failed"
            );
        }
    }

    /// Invoke every subscribed listener sequentially inside the invocation
    /// context. The first error short-circuits; a tripped deadline between
    /// listeners aborts the event.
    fn invoke_all(&self, ctx: &Context, event: &Event) -> Result<(), Invocation> {
        for listener in self.listeners_for(event.key()) {
            match ctx.err() {
                Err(ContextError::DeadlineExceeded) => return Err(Invocation::DeadlineTripped),
                Err(ContextError::Cancelled) => {
                    return Err(Invocation::Listener(ListenerError::new("cancelled")));
                }
                Ok(()) => {}
            }
            invoke(listener.as_ref(), ctx, event).map_err(Invocation::Listener)?;
        }

        // The budget is shared by all listeners; a listener that returned Ok
        // after the deadline still aborts the event.
        match ctx.err() {
            Err(ContextError::DeadlineExceeded) => Err(Invocation::DeadlineTripped),
            _ => Ok(()),
        }
    }

    fn fan_out(&self, ctx: &Context, event: &Event) -> Result<(), ListenerError> {
        for listener in self.listeners_for(event.key()) {
            invoke(listener.as_ref(), ctx, event)?;
        }
        Ok(())
    }

    fn listeners_for(&self, key: &str) -> Vec<Arc<dyn Listener>> {
        let table = self.listeners.read().unwrap();
        table.get(key).cloned().unwrap_or_default()
    }

    fn emit_system(&self, ctx: &Context, key: &str, persisted: &PersistedEvent, reason: &str) {
        let payload = SystemEventPayload {
            event: persisted.clone(),
            error: reason.to_string(),
        };
        match Event::new(key, &payload) {
            Ok(event) => {
                if let Err(err) = self.fan_out(ctx, &event) {
                    warn!(queue = %self.name, key, error = %err, "system event listener failed");
                }
            }
            Err(err) => warn!(queue = %self.name, key, error = %err, "system event encode failed"),
        }
    }
}

enum Invocation {
    Listener(ListenerError),
    DeadlineTripped,
}

/// Call a listener, converting panics into listener errors.
fn invoke(listener: &dyn Listener, ctx: &Context, event: &Event) -> Result<(), ListenerError> {
    match panic::catch_unwind(AssertUnwindSafe(|| listener.handle(ctx, event))) {
        Ok(result) => result,
        Err(payload) => Err(ListenerError(panic_message(payload))),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "listener panicked".to_string()
    }
}

static DEFAULT: OnceLock<Arc<Dispatcher>> = OnceLock::new();

/// Install the process-wide default dispatcher. Fails if one is already
/// installed; applications wanting isolation should construct their own
/// instance instead.
pub fn set_default_dispatcher(dispatcher: Arc<Dispatcher>) -> Result<(), Arc<Dispatcher>> {
    DEFAULT.set(dispatcher)
}

/// The process-wide default dispatcher, if one was installed.
pub fn default_dispatcher() -> Option<Arc<Dispatcher>> {
    DEFAULT.get().cloned()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::MemoryDriver;

    use super::*;

    struct Recording {
        id: &'static str,
        keys: Vec<String>,
        calls: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    impl Listener for Recording {
        fn listen(&self) -> Vec<String> {
            self.keys.clone()
        }

        fn handle(&self, _ctx: &Context, _event: &Event) -> Result<(), ListenerError> {
            self.calls.lock().unwrap().push(self.id);
            if self.fail {
                return Err(ListenerError::new("boom"));
            }
            Ok(())
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            "test",
            Arc::new(MemoryDriver::new(Duration::from_millis(50))),
        )
        .with_parallelism(1)
    }

    #[test]
    fn transient_fan_out_in_registration_order() {
        let dispatcher = dispatcher();
        let calls = Arc::new(Mutex::new(Vec::new()));

        dispatcher.subscribe(Arc::new(Recording {
            id: "first",
            keys: vec!["m".to_string()],
            calls: calls.clone(),
            fail: false,
        }));
        dispatcher.subscribe(Arc::new(Recording {
            id: "second",
            keys: vec!["m".to_string()],
            calls: calls.clone(),
            fail: false,
        }));

        let ctx = Context::background();
        let event = Event::from_value("m", serde_json::json!({}));
        dispatcher.dispatch(&ctx, event).unwrap();

        assert_eq!(*calls.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn first_error_short_circuits_fan_out() {
        let dispatcher = dispatcher();
        let calls = Arc::new(Mutex::new(Vec::new()));

        dispatcher.subscribe(Arc::new(Recording {
            id: "failing",
            keys: vec!["m".to_string()],
            calls: calls.clone(),
            fail: true,
        }));
        dispatcher.subscribe(Arc::new(Recording {
            id: "never",
            keys: vec!["m".to_string()],
            calls: calls.clone(),
            fail: false,
        }));

        let ctx = Context::background();
        let event = Event::from_value("m", serde_json::json!({}));
        let result = dispatcher.dispatch(&ctx, event);

        assert!(matches!(result, Err(DispatchError::Listener(_))));
        assert_eq!(*calls.lock().unwrap(), vec!["failing"]);
    }

    #[test]
    fn listeners_only_see_their_event_types() {
        let dispatcher = dispatcher();
        let calls = Arc::new(Mutex::new(Vec::new()));

        dispatcher.subscribe(Arc::new(Recording {
            id: "other",
            keys: vec!["other".to_string()],
            calls: calls.clone(),
            fail: false,
        }));

        let ctx = Context::background();
        let event = Event::from_value("m", serde_json::json!({}));
        dispatcher.dispatch(&ctx, event).unwrap();

        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn panicking_listener_becomes_an_error() {
        struct Panicking;

        impl Listener for Panicking {
            fn listen(&self) -> Vec<String> {
                vec!["m".to_string()]
            }

            fn handle(&self, _ctx: &Context, _event: &Event) -> Result<(), ListenerError> {
                panic!("kaboom");
            }
        }

        let dispatcher = dispatcher();
        dispatcher.subscribe(Arc::new(Panicking));

        let ctx = Context::background();
        let event = Event::from_value("m", serde_json::json!({}));
        let result = dispatcher.dispatch(&ctx, event);

        match result {
            Err(DispatchError::Listener(err)) => assert_eq!(err.0, "kaboom"),
            other => panic!("expected listener error, got {other:?}"),
        }
    }

    #[test]
    fn persistent_dispatch_reaches_the_driver() {
        let driver = Arc::new(MemoryDriver::new(Duration::from_millis(50)));
        let dispatcher = Dispatcher::new("test", driver.clone()).with_parallelism(1);

        let ctx = Context::background();
        let event = Event::from_value("m", serde_json::json!({"value": "hello"}));
        dispatcher
            .dispatch(&ctx, crate::event::persist(event))
            .unwrap();

        let info = driver.info(&ctx).unwrap();
        assert_eq!(info.waiting, 1);
    }

    #[test]
    fn deferred_dispatch_lands_in_delayed() {
        let driver = Arc::new(MemoryDriver::new(Duration::from_millis(50)));
        let dispatcher = Dispatcher::new("test", driver.clone()).with_parallelism(1);

        let ctx = Context::background();
        let event = Event::from_value("m", serde_json::json!({}));
        dispatcher
            .dispatch(
                &ctx,
                crate::event::persist(event).defer(Duration::from_secs(3600)),
            )
            .unwrap();

        let info = driver.info(&ctx).unwrap();
        assert_eq!(info.waiting, 0);
        assert_eq!(info.delayed, 1);
    }

    #[test]
    fn subscribe_during_dispatch_does_not_deadlock() {
        let dispatcher = Arc::new(dispatcher());
        let seen = Arc::new(AtomicUsize::new(0));

        struct Counting {
            seen: Arc<AtomicUsize>,
        }

        impl Listener for Counting {
            fn listen(&self) -> Vec<String> {
                vec!["m".to_string()]
            }

            fn handle(&self, _ctx: &Context, _event: &Event) -> Result<(), ListenerError> {
                self.seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        dispatcher.subscribe(Arc::new(Counting { seen: seen.clone() }));

        let ctx = Context::background();
        for _ in 0..10 {
            let event = Event::from_value("m", serde_json::json!({}));
            dispatcher.dispatch(&ctx, event).unwrap();
        }
        assert_eq!(seen.load(Ordering::SeqCst), 10);
    }
}
