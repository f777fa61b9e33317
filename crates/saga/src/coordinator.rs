//! Saga registry and transaction handle.
//!
//! Steps of one session run sequentially on the caller's thread. Every
//! transition is persisted before the step runs and acknowledged after, so
//! recovery can compensate whatever a crash left behind. After the first
//! failure the handle is aborted: further `execute` calls are no-ops
//! returning the recorded error, and `rollback` compensates the executed
//! steps in reverse order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

use trellis_core::{Context, CorrelationId};

use crate::log::{SagaLogEntry, SagaLogError, SagaLogStore};

/// Error returned by a step's `run` or `compensate` operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct StepError(pub String);

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for StepError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for StepError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

type StepFn = Arc<dyn Fn(&Context, &JsonValue) -> Result<(), StepError> + Send + Sync>;

/// Session timeout from `SAGA_DEFAULT_TIMEOUT_SECS`, defaulting to 600s.
/// Used for sagas that do not pin their own timeout and as the staleness
/// bound of the log stores.
pub fn default_saga_timeout() -> Duration {
    std::env::var("SAGA_DEFAULT_TIMEOUT_SECS")
        .ok()
        .and_then(|value| value.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(600))
}

/// One forward operation plus its compensation.
///
/// Both closures must be idempotent over the correlation id carried in the
/// context; `compensate` must additionally tolerate running without a
/// prior `run` (null compensation).
#[derive(Clone)]
pub struct Step {
    name: String,
    run: StepFn,
    compensate: StepFn,
}

impl Step {
    pub fn new<R, C>(name: impl Into<String>, run: R, compensate: C) -> Self
    where
        R: Fn(&Context, &JsonValue) -> Result<(), StepError> + Send + Sync + 'static,
        C: Fn(&Context, &JsonValue) -> Result<(), StepError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(run),
            compensate: Arc::new(compensate),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn compensate(&self) -> &StepFn {
        &self.compensate
    }
}

/// An ordered list of steps plus the session timeout.
pub struct Saga {
    name: String,
    timeout: Duration,
    steps: Vec<Step>,
}

impl Saga {
    pub fn new(name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            timeout,
            steps: Vec::new(),
        }
    }

    /// Append a step. Step numbers are assigned from declaration order,
    /// starting at 1.
    pub fn step<R, C>(mut self, name: impl Into<String>, run: R, compensate: C) -> Self
    where
        R: Fn(&Context, &JsonValue) -> Result<(), StepError> + Send + Sync + 'static,
        C: Fn(&Context, &JsonValue) -> Result<(), StepError> + Send + Sync + 'static,
    {
        self.steps.push(Step::new(name, run, compensate));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn step_by_name(&self, name: &str) -> Option<(u32, &Step)> {
        self.steps
            .iter()
            .position(|s| s.name == name)
            .map(|index| ((index + 1) as u32, &self.steps[index]))
    }

    pub(crate) fn step_by_number(&self, number: u32) -> Option<&Step> {
        if number == 0 {
            return None;
        }
        self.steps.get((number - 1) as usize)
    }
}

/// Aggregated rollback outcome: the original `run` failure (if any) plus
/// every compensation failure collected along the way.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SagaError {
    pub cause: Option<StepError>,
    pub compensation_errors: Vec<StepError>,
}

impl SagaError {
    /// True when nothing went wrong (a rollback of a clean session).
    pub fn is_empty(&self) -> bool {
        self.cause.is_none() && self.compensation_errors.is_empty()
    }
}

impl core::fmt::Display for SagaError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "saga aborted: {cause}")?,
            None => write!(f, "saga rolled back")?,
        }
        for error in &self.compensation_errors {
            write!(f, "; compensation failed: {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SagaError {}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("unknown saga: {0}")]
    UnknownSaga(String),

    #[error(transparent)]
    Log(#[from] SagaLogError),
}

/// Saga definitions keyed by name.
pub struct Registry {
    store: Arc<dyn SagaLogStore>,
    sagas: RwLock<HashMap<String, Arc<Saga>>>,
}

impl Registry {
    pub fn new(store: Arc<dyn SagaLogStore>) -> Self {
        Self {
            store,
            sagas: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, saga: Saga) {
        let mut sagas = self.sagas.write().unwrap();
        sagas.insert(saga.name.clone(), Arc::new(saga));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Saga>> {
        self.sagas.read().unwrap().get(name).cloned()
    }

    pub fn store(&self) -> &Arc<dyn SagaLogStore> {
        &self.store
    }

    /// Open a new session: mint a correlation id, persist the `Session`
    /// entry, and return the transaction handle plus a context carrying
    /// the id and bounded by the saga timeout.
    pub fn start_tx(
        &self,
        ctx: &Context,
        saga_name: &str,
    ) -> Result<(Transaction, Context), CoordinatorError> {
        let saga = self
            .get(saga_name)
            .ok_or_else(|| CoordinatorError::UnknownSaga(saga_name.to_string()))?;

        let correlation_id = CorrelationId::new();
        self.store
            .log(SagaLogEntry::session(correlation_id.as_str(), &saga.name))?;

        let tx_ctx = ctx
            .with_correlation_id(correlation_id.clone())
            .with_timeout(saga.timeout);
        let transaction = Transaction {
            saga,
            store: self.store.clone(),
            correlation_id,
            executed: Mutex::new(Vec::new()),
            aborted: Mutex::new(None),
        };
        Ok((transaction, tx_ctx))
    }
}

struct ExecutedStep {
    step_number: u32,
    step_name: String,
    request: JsonValue,
}

/// Handle for one saga session.
pub struct Transaction {
    saga: Arc<Saga>,
    store: Arc<dyn SagaLogStore>,
    correlation_id: CorrelationId,
    executed: Mutex<Vec<ExecutedStep>>,
    aborted: Mutex<Option<StepError>>,
}

impl Transaction {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Run the named step with the given request.
    ///
    /// Once a step has failed (or the session deadline passed) the handle
    /// is aborted and every later call returns the recorded error without
    /// running anything.
    pub fn execute(
        &self,
        ctx: &Context,
        step_name: &str,
        request: &JsonValue,
    ) -> Result<(), StepError> {
        if let Some(error) = self.aborted.lock().unwrap().clone() {
            return Err(error);
        }

        if let Err(reason) = ctx.err() {
            let error = StepError::new(reason.to_string());
            *self.aborted.lock().unwrap() = Some(error.clone());
            return Err(error);
        }

        let Some((step_number, step)) = self.saga.step_by_name(step_name) else {
            let error = StepError::new(format!("unknown step: {step_name}"));
            *self.aborted.lock().unwrap() = Some(error.clone());
            return Err(error);
        };

        let mut entry = SagaLogEntry::executed(
            self.correlation_id.as_str(),
            self.saga.name(),
            step_number,
            step_name,
        );
        self.store
            .log(entry.clone())
            .map_err(|e| StepError::new(e.to_string()))?;

        // Recorded before running, so a failed or interrupted run is still
        // rolled back.
        self.executed.lock().unwrap().push(ExecutedStep {
            step_number,
            step_name: step_name.to_string(),
            request: request.clone(),
        });

        let result = (step.run)(ctx, request);

        entry.finish(result.as_ref().err().map(|e| e.0.clone()));
        if let Err(err) = self.store.ack(&entry) {
            warn!(
                correlation_id = %self.correlation_id,
                step = step_name,
                error = %err,
                "failed to ack executed step"
            );
        }

        if let Err(error) = &result {
            *self.aborted.lock().unwrap() = Some(error.clone());
        }
        result
    }

    /// A callable bound to one step, the form step invocations take when
    /// handed to a transport layer. Calling it is exactly
    /// [`Transaction::execute`] for that step.
    pub fn endpoint(
        &self,
        step_name: &str,
    ) -> impl Fn(&Context, &JsonValue) -> Result<(), StepError> + '_ {
        let step_name = step_name.to_string();
        move |ctx: &Context, request: &JsonValue| self.execute(ctx, &step_name, request)
    }

    /// Write the terminal `Committed` entry for the session.
    pub fn commit(&self, _ctx: &Context) -> Result<(), CoordinatorError> {
        self.store.log(SagaLogEntry::committed(
            self.correlation_id.as_str(),
            self.saga.name(),
        ))?;
        Ok(())
    }

    /// Compensate every executed step in reverse order.
    ///
    /// A failing compensation does not halt the sweep; its error joins the
    /// aggregate alongside the original failure.
    pub fn rollback(&self, ctx: &Context) -> SagaError {
        let cause = self.aborted.lock().unwrap().clone();
        let executed = {
            let mut list = self.executed.lock().unwrap();
            std::mem::take(&mut *list)
        };

        let mut compensation_errors = Vec::new();
        for step in executed.iter().rev() {
            let Some(definition) = self.saga.step_by_number(step.step_number) else {
                continue;
            };

            let mut entry = SagaLogEntry::compensated(
                self.correlation_id.as_str(),
                self.saga.name(),
                step.step_number,
                &step.step_name,
            );
            if let Err(err) = self.store.log(entry.clone()) {
                compensation_errors.push(StepError::new(err.to_string()));
                continue;
            }

            let result = (definition.compensate)(ctx, &step.request);

            entry.finish(result.as_ref().err().map(|e| e.0.clone()));
            if let Err(err) = self.store.ack(&entry) {
                warn!(
                    correlation_id = %self.correlation_id,
                    step = %step.step_name,
                    error = %err,
                    "failed to ack compensation"
                );
            }

            if let Err(error) = result {
                compensation_errors.push(error);
            }
        }

        SagaError {
            cause,
            compensation_errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};

    use crate::log::{MemorySagaLogStore, SagaLogStore, SagaLogType};

    use super::*;

    fn counter_saga(counter: Arc<AtomicI64>) -> Saga {
        let increment = counter.clone();
        let decrement_one = counter.clone();
        let increment_again = counter.clone();
        let decrement_two = counter;

        Saga::new("counter", Duration::from_secs(600))
            .step(
                "first",
                move |_ctx, _req| {
                    increment.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                move |_ctx, _req| {
                    decrement_one.fetch_add(-1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .step(
                "second",
                move |_ctx, _req| {
                    increment_again.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                move |_ctx, _req| {
                    decrement_two.fetch_add(-1, Ordering::SeqCst);
                    Ok(())
                },
            )
    }

    fn registry_with(saga: Saga) -> (Registry, Arc<MemorySagaLogStore>) {
        let store = Arc::new(MemorySagaLogStore::default());
        let registry = Registry::new(store.clone());
        registry.register(saga);
        (registry, store)
    }

    #[test]
    fn happy_path_commits() {
        let counter = Arc::new(AtomicI64::new(0));
        let (registry, store) = registry_with(counter_saga(counter.clone()));

        let ctx = Context::background();
        let (tx, tx_ctx) = registry.start_tx(&ctx, "counter").unwrap();

        tx.execute(&tx_ctx, "first", &serde_json::json!({})).unwrap();
        tx.execute(&tx_ctx, "second", &serde_json::json!({})).unwrap();
        tx.commit(&tx_ctx).unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 2);

        let entries = store.entries();
        assert_eq!(entries[0].log_type, SagaLogType::Session);
        assert_eq!(entries.last().unwrap().log_type, SagaLogType::Committed);
        assert!(store.unacknowledged_steps(tx.correlation_id().as_str()).unwrap().is_empty());
    }

    #[test]
    fn failure_rolls_back_executed_steps() {
        let counter = Arc::new(AtomicI64::new(0));
        let increment = counter.clone();
        let decrement = counter.clone();

        let saga = Saga::new("failing", Duration::from_secs(600))
            .step(
                "first",
                move |_ctx, _req| {
                    increment.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                move |_ctx, _req| {
                    decrement.fetch_add(-1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .step(
                "second",
                |_ctx, _req| Err(StepError::new("charge declined")),
                |_ctx, _req| Ok(()),
            );

        let (registry, _store) = registry_with(saga);
        let ctx = Context::background();
        let (tx, tx_ctx) = registry.start_tx(&ctx, "failing").unwrap();

        tx.execute(&tx_ctx, "first", &serde_json::json!({})).unwrap();
        let failure = tx.execute(&tx_ctx, "second", &serde_json::json!({}));
        assert!(failure.is_err());

        let result = tx.rollback(&tx_ctx);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(result.cause, Some(StepError::new("charge declined")));
        assert!(result.compensation_errors.is_empty());
    }

    #[test]
    fn execute_after_failure_is_a_no_op() {
        let counter = Arc::new(AtomicI64::new(0));
        let ran = counter.clone();

        let saga = Saga::new("aborting", Duration::from_secs(600))
            .step("first", |_ctx, _req| Err(StepError::new("boom")), |_ctx, _req| Ok(()))
            .step(
                "second",
                move |_ctx, _req| {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                |_ctx, _req| Ok(()),
            );

        let (registry, _store) = registry_with(saga);
        let ctx = Context::background();
        let (tx, tx_ctx) = registry.start_tx(&ctx, "aborting").unwrap();

        assert!(tx.execute(&tx_ctx, "first", &serde_json::json!({})).is_err());

        let second = tx.execute(&tx_ctx, "second", &serde_json::json!({}));
        assert_eq!(second, Err(StepError::new("boom")));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failing_compensations_join_the_aggregate() {
        let saga = Saga::new("stubborn", Duration::from_secs(600))
            .step(
                "first",
                |_ctx, _req| Ok(()),
                |_ctx, _req| Err(StepError::new("undo first failed")),
            )
            .step(
                "second",
                |_ctx, _req| Err(StepError::new("boom")),
                |_ctx, _req| Err(StepError::new("undo second failed")),
            );

        let (registry, _store) = registry_with(saga);
        let ctx = Context::background();
        let (tx, tx_ctx) = registry.start_tx(&ctx, "stubborn").unwrap();

        tx.execute(&tx_ctx, "first", &serde_json::json!({})).unwrap();
        let _ = tx.execute(&tx_ctx, "second", &serde_json::json!({}));

        let result = tx.rollback(&tx_ctx);
        assert_eq!(result.cause, Some(StepError::new("boom")));
        // Both compensations ran despite failing, latest step first.
        assert_eq!(
            result.compensation_errors,
            vec![
                StepError::new("undo second failed"),
                StepError::new("undo first failed"),
            ]
        );
        let rendered = result.to_string();
        assert!(rendered.contains("boom"));
        assert!(rendered.contains("undo first failed"));
    }

    #[test]
    fn step_endpoints_are_plain_callables() {
        let counter = Arc::new(AtomicI64::new(0));
        let (registry, _store) = registry_with(counter_saga(counter.clone()));

        let ctx = Context::background();
        let (tx, tx_ctx) = registry.start_tx(&ctx, "counter").unwrap();

        let first = tx.endpoint("first");
        let second = tx.endpoint("second");
        first(&tx_ctx, &serde_json::json!({})).unwrap();
        second(&tx_ctx, &serde_json::json!({})).unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unknown_saga_is_rejected() {
        let store = Arc::new(MemorySagaLogStore::default());
        let registry = Registry::new(store);
        let ctx = Context::background();

        assert!(matches!(
            registry.start_tx(&ctx, "missing"),
            Err(CoordinatorError::UnknownSaga(_))
        ));
    }

    #[test]
    fn tx_context_carries_correlation_id_and_deadline() {
        let counter = Arc::new(AtomicI64::new(0));
        let (registry, _store) = registry_with(counter_saga(counter));

        let ctx = Context::background();
        let (tx, tx_ctx) = registry.start_tx(&ctx, "counter").unwrap();

        assert_eq!(
            tx_ctx.correlation_id().map(|id| id.as_str()),
            Some(tx.correlation_id().as_str())
        );
        assert!(tx_ctx.remaining().is_some());
    }
}
