//! Named dispatcher instances.
//!
//! A factory keeps one live dispatcher per queue name, building them
//! lazily on first request. `reload` drops the cache so the next request
//! rebuilds with fresh configuration; wiring the transient
//! `config.reloaded` event to [`ConfigReloadListener`] makes that happen
//! on configuration changes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use trellis_core::Context;

use crate::dispatcher::{DispatchError, Dispatcher, Listener, ListenerError};
use crate::event::Event;

/// Transient event announcing that external configuration was reloaded.
pub const CONFIG_RELOADED_EVENT: &str = "config.reloaded";

type Constructor = Box<dyn Fn(&str) -> Result<Arc<Dispatcher>, DispatchError> + Send + Sync>;

/// Lazily-built, cached, named [`Dispatcher`] instances.
pub struct DispatcherFactory {
    constructor: Constructor,
    instances: Mutex<HashMap<String, Arc<Dispatcher>>>,
}

impl DispatcherFactory {
    pub fn new<F>(constructor: F) -> Self
    where
        F: Fn(&str) -> Result<Arc<Dispatcher>, DispatchError> + Send + Sync + 'static,
    {
        Self {
            constructor: Box::new(constructor),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// The dispatcher for `name`, built on first request and cached after.
    pub fn get(&self, name: &str) -> Result<Arc<Dispatcher>, DispatchError> {
        let mut instances = self.instances.lock().unwrap();
        if let Some(dispatcher) = instances.get(name) {
            return Ok(dispatcher.clone());
        }

        let dispatcher = (self.constructor)(name)?;
        instances.insert(name.to_string(), dispatcher.clone());
        info!(queue = name, "built queue dispatcher");
        Ok(dispatcher)
    }

    /// Drop every cached instance so subsequent requests rebuild with
    /// fresh configuration. Drivers of dropped instances are closed.
    pub fn reload(&self) {
        let dropped = {
            let mut instances = self.instances.lock().unwrap();
            std::mem::take(&mut *instances)
        };
        for (name, dispatcher) in dropped {
            if let Err(err) = dispatcher.driver().close() {
                warn!(queue = %name, error = %err, "closing driver on reload failed");
            }
        }
        info!("dispatcher factory reloaded");
    }

    /// Close all drivers and clear the cache.
    pub fn close(&self) {
        self.reload();
    }
}

/// Listener that reloads a factory when configuration changes.
pub struct ConfigReloadListener {
    factory: Arc<DispatcherFactory>,
}

impl ConfigReloadListener {
    pub fn new(factory: Arc<DispatcherFactory>) -> Self {
        Self { factory }
    }
}

impl Listener for ConfigReloadListener {
    fn listen(&self) -> Vec<String> {
        vec![CONFIG_RELOADED_EVENT.to_string()]
    }

    fn handle(&self, _ctx: &Context, _event: &Event) -> Result<(), ListenerError> {
        self.factory.reload();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::MemoryDriver;

    use super::*;

    fn counting_factory() -> (DispatcherFactory, Arc<AtomicUsize>) {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let factory = DispatcherFactory::new(move |name| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Dispatcher::new(
                name,
                Arc::new(MemoryDriver::new(Duration::from_millis(50))),
            )))
        });
        (factory, builds)
    }

    #[test]
    fn same_name_returns_same_instance() {
        let (factory, builds) = counting_factory();

        let first = factory.get("emails").unwrap();
        let second = factory.get("emails").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn different_names_build_separately() {
        let (factory, builds) = counting_factory();

        factory.get("emails").unwrap();
        factory.get("reports").unwrap();

        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reload_drops_cached_instances() {
        let (factory, builds) = counting_factory();

        let before = factory.get("emails").unwrap();
        factory.reload();
        let after = factory.get("emails").unwrap();

        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn config_reload_event_triggers_reload() {
        let (factory, builds) = counting_factory();
        let factory = Arc::new(factory);

        let control =
            Dispatcher::new("control", Arc::new(MemoryDriver::new(Duration::from_millis(50))));
        control.subscribe(Arc::new(ConfigReloadListener::new(factory.clone())));

        factory.get("emails").unwrap();

        let ctx = Context::background();
        let event = Event::from_value(CONFIG_RELOADED_EVENT, serde_json::json!({}));
        control.dispatch(&ctx, event).unwrap();

        factory.get("emails").unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }
}
