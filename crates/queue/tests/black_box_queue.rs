//! Black-box tests over the public queue API only.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use trellis_core::{Context, RunGroup};
use trellis_queue::{
    Channel, Dispatcher, DispatcherFactory, Driver, Event, Listener, ListenerError, MemoryDriver,
    QueueConfig, persist,
};

struct Counting {
    key: String,
    seen: Arc<AtomicUsize>,
}

impl Listener for Counting {
    fn listen(&self) -> Vec<String> {
        vec![self.key.clone()]
    }

    fn handle(&self, _ctx: &Context, _event: &Event) -> Result<(), ListenerError> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    predicate()
}

#[test]
fn factory_built_dispatcher_delivers_through_a_run_group() {
    let factory = Arc::new(DispatcherFactory::new(|name| {
        let config = QueueConfig::new(name).with_parallelism(2);
        let driver = Arc::new(MemoryDriver::new(Duration::from_millis(50)));
        Ok(Arc::new(
            Dispatcher::new(&config.name, driver).with_parallelism(config.parallelism),
        ))
    }));

    let dispatcher = factory.get("emails").unwrap();
    let seen = Arc::new(AtomicUsize::new(0));
    dispatcher.subscribe(Arc::new(Counting {
        key: "email.requested".to_string(),
        seen: seen.clone(),
    }));

    let mut group = RunGroup::new();
    {
        let dispatcher = dispatcher.clone();
        group.add("emails-consumer", move |ctx: Context| dispatcher.consume(&ctx));
    }

    let (ctx, token) = Context::cancellable();
    let runner = thread::spawn(move || group.run(&ctx));

    let publish_ctx = Context::background();
    let event = Event::from_value("email.requested", serde_json::json!({"to": "ops"}));
    dispatcher.dispatch(&publish_ctx, persist(event)).unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        seen.load(Ordering::SeqCst) == 1
    }));

    token.cancel();
    runner.join().unwrap();
}

#[test]
fn dead_letters_survive_for_manual_reload() {
    let driver: Arc<MemoryDriver> = Arc::new(MemoryDriver::new(Duration::from_millis(50)));
    let dispatcher = Arc::new(Dispatcher::new("reports", driver.clone()).with_parallelism(1));

    struct AlwaysFailing;
    impl Listener for AlwaysFailing {
        fn listen(&self) -> Vec<String> {
            vec!["report.render".to_string()]
        }

        fn handle(&self, _ctx: &Context, _event: &Event) -> Result<(), ListenerError> {
            Err(ListenerError::new("renderer offline"))
        }
    }
    dispatcher.subscribe(Arc::new(AlwaysFailing));

    let ctx = Context::background();
    dispatcher
        .dispatch(
            &ctx,
            persist(Event::from_value("report.render", serde_json::json!({}))),
        )
        .unwrap();

    let (consumer_ctx, token) = Context::cancellable();
    let consumer = {
        let dispatcher = dispatcher.clone();
        thread::spawn(move || dispatcher.consume(&consumer_ctx))
    };

    assert!(wait_until(Duration::from_secs(2), || {
        driver.info(&ctx).map(|info| info.failed).unwrap_or(0) == 1
    }));

    token.cancel();
    consumer.join().unwrap();

    // The operator flow: reload the dead letters, then they are waiting
    // again with their attempt history intact.
    assert_eq!(driver.reload(&ctx, Channel::Failed).unwrap(), 1);
    assert_eq!(driver.info(&ctx).unwrap().waiting, 1);
    assert_eq!(driver.reload(&ctx, Channel::Failed).unwrap(), 0);
}
