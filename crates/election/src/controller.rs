//! Election controller: atomic leadership flag + transition events.
//!
//! Wraps a driver, tracks `is_leader`, and publishes every transition as
//! an ordinary transient dispatcher event so the rest of the process
//! (saga recovery, application listeners) can react. Transitions are
//! serialized by the campaign thread; `resign` defers the flag flip and
//! event emission until after the driver's resign returns.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use trellis_core::Context;
use trellis_queue::{Dispatcher, Event};

use crate::driver::{ElectionDriver, ElectionError};

/// Transient event published on every leadership transition.
pub const STATUS_CHANGED_EVENT: &str = "leader.status_changed";

/// Payload of [`STATUS_CHANGED_EVENT`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChanged {
    pub node_id: String,
    pub is_leader: bool,
}

/// Single-leader coordinator around an [`ElectionDriver`].
pub struct Controller {
    driver: Arc<dyn ElectionDriver>,
    dispatcher: Option<Arc<Dispatcher>>,
    node_id: String,
    is_leader: Arc<AtomicBool>,
}

impl Controller {
    pub fn new(driver: Arc<dyn ElectionDriver>) -> Self {
        Self {
            driver,
            dispatcher: None,
            node_id: Uuid::now_v7().to_string(),
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Publish transition events through this dispatcher.
    pub fn with_dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// The flag itself, for gating work on leadership (e.g. saga
    /// recovery). Written only by this controller.
    pub fn leader_flag(&self) -> Arc<AtomicBool> {
        self.is_leader.clone()
    }

    /// Drive the election until the context is cancelled, updating the
    /// flag and publishing a [`StatusChanged`] event on every transition.
    pub fn campaign(&self, ctx: &Context) -> Result<(), ElectionError> {
        self.driver
            .campaign(ctx, &|is_leader| self.transition(ctx, is_leader))
    }

    /// Release leadership. Returns [`ElectionError::NotLeader`] when this
    /// controller does not currently hold it; otherwise the flag flip and
    /// event emission happen only after the driver's resign returns.
    pub fn resign(&self, ctx: &Context) -> Result<(), ElectionError> {
        if !self.is_leader() {
            return Err(ElectionError::NotLeader);
        }
        self.driver.resign(ctx)?;
        self.transition(ctx, false);
        Ok(())
    }

    /// Lifecycle run hook: campaign with the given cancellable context,
    /// restarting after driver errors until cancelled.
    pub fn run(&self, ctx: &Context) {
        loop {
            if ctx.err().is_err() {
                return;
            }
            match self.campaign(ctx) {
                Ok(()) => {}
                Err(error) => {
                    warn!(node = %self.node_id, error = %error, "campaign aborted, restarting");
                }
            }
            if ctx.sleep(Duration::from_secs(1)).is_err() {
                return;
            }
        }
    }

    /// Lifecycle close hook: resign if leading.
    pub fn close(&self, ctx: &Context) {
        if self.is_leader() {
            if let Err(error) = self.resign(ctx) {
                warn!(node = %self.node_id, error = %error, "resign on close failed");
            }
        }
    }

    fn transition(&self, ctx: &Context, is_leader: bool) {
        let previous = self.is_leader.swap(is_leader, Ordering::SeqCst);
        if previous == is_leader {
            return;
        }

        info!(node = %self.node_id, is_leader, "leadership changed");

        let Some(dispatcher) = &self.dispatcher else {
            return;
        };
        let payload = StatusChanged {
            node_id: self.node_id.clone(),
            is_leader,
        };
        match Event::new(STATUS_CHANGED_EVENT, &payload) {
            Ok(event) => {
                if let Err(error) = dispatcher.dispatch(ctx, event) {
                    warn!(node = %self.node_id, error = %error, "status event dispatch failed");
                }
            }
            Err(error) => {
                warn!(node = %self.node_id, error = %error, "status event encode failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::thread;
    use std::time::Instant;

    use trellis_core::CancelToken;
    use trellis_queue::{Listener, ListenerError, MemoryDriver};

    use crate::driver::{LeaseStore, MemoryLeaseStore};
    use crate::lease::{LeaseConfig, LeaseElectionDriver};

    use super::*;

    struct TransitionProbe {
        seen: Arc<Mutex<Vec<StatusChanged>>>,
    }

    impl Listener for TransitionProbe {
        fn listen(&self) -> Vec<String> {
            vec![STATUS_CHANGED_EVENT.to_string()]
        }

        fn handle(&self, _ctx: &Context, event: &Event) -> Result<(), ListenerError> {
            let payload: StatusChanged = event
                .decode()
                .map_err(|e| ListenerError::new(e.to_string()))?;
            self.seen.lock().unwrap().push(payload);
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

    fn controller(
        store: Arc<dyn LeaseStore>,
        node: &str,
        dispatcher: Arc<Dispatcher>,
    ) -> Arc<Controller> {
        let driver = Arc::new(LeaseElectionDriver::new(
            store,
            "trellis",
            "test",
            node,
            LeaseConfig {
                lease_ttl: Duration::from_millis(150),
                retry_interval: Duration::from_millis(30),
            },
        ));
        Arc::new(
            Controller::new(driver)
                .with_dispatcher(dispatcher)
                .with_node_id(node),
        )
    }

    fn start(controller: Arc<Controller>) -> (CancelToken, thread::JoinHandle<()>) {
        let (ctx, token) = Context::cancellable();
        let handle = thread::spawn(move || controller.run(&ctx));
        (token, handle)
    }

    #[test]
    fn resign_without_leadership_is_rejected() {
        let store = Arc::new(MemoryLeaseStore::new());
        let driver = Arc::new(LeaseElectionDriver::new(
            store,
            "trellis",
            "test",
            "node-1",
            LeaseConfig::default(),
        ));
        let controller = Controller::new(driver);

        assert!(matches!(
            controller.resign(&Context::background()),
            Err(ElectionError::NotLeader)
        ));
    }

    #[test]
    fn hand_off_between_two_controllers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Arc::new(Dispatcher::new(
            "control",
            Arc::new(MemoryDriver::new(Duration::from_millis(50))),
        ));
        dispatcher.subscribe(Arc::new(TransitionProbe { seen: seen.clone() }));

        let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());
        let first = controller(store.clone(), "c1", dispatcher.clone());
        let second = controller(store, "c2", dispatcher);

        let (token1, handle1) = start(first.clone());

        // First campaigner wins while it is alone.
        assert!(wait_until(Duration::from_secs(3), || first.is_leader()));

        let (token2, handle2) = start(second.clone());
        thread::sleep(Duration::from_millis(100));
        assert!(!second.is_leader());

        first.resign(&Context::background()).unwrap();

        assert!(wait_until(Duration::from_secs(3), || second.is_leader()));
        assert!(!first.is_leader());

        // Subscriber saw the transitions in emission order.
        let transitions = seen.lock().unwrap().clone();
        let expected = [("c1", true), ("c1", false), ("c2", true)];
        assert!(transitions.len() >= 3);
        for (observed, (node, is_leader)) in transitions.iter().zip(expected.iter()) {
            assert_eq!(observed.node_id, *node);
            assert_eq!(observed.is_leader, *is_leader);
        }

        token1.cancel();
        token2.cancel();
        handle1.join().unwrap();
        handle2.join().unwrap();
    }

    #[test]
    fn close_resigns_a_leader() {
        let dispatcher = Arc::new(Dispatcher::new(
            "control",
            Arc::new(MemoryDriver::new(Duration::from_millis(50))),
        ));
        let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());
        let leader = controller(store.clone(), "c1", dispatcher);

        let (token, handle) = start(leader.clone());
        assert!(wait_until(Duration::from_secs(3), || leader.is_leader()));

        leader.close(&Context::background());
        assert!(!leader.is_leader());

        let ctx = Context::background();
        assert!(store.holder(&ctx, "trellis/leader-election/test").unwrap().is_none());

        token.cancel();
        handle.join().unwrap();
    }
}
