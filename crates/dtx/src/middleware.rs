//! Endpoint middleware: idempotence, mutual exclusion, and attempt/cancel
//! ordering for TCC participants.
//!
//! Every middleware branches on the correlation id in the context: absent
//! means the request is not part of a distributed transaction and passes
//! straight through.

use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use trellis_core::Context;

use crate::store::{Locker, Oncer, Sequencer};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DtxError {
    /// The correlation id was already processed by this participant.
    #[error("request is not idempotent: correlation id {0} was already processed")]
    NonIdempotent(String),

    /// Lock acquisition failed within the context deadline.
    #[error("failed to acquire lock for correlation id {0}")]
    NoLock(String),

    /// The backing marker store failed.
    #[error("marker store error: {0}")]
    Store(String),

    /// Downstream application failure surfaced through the middleware
    /// chain.
    #[error("{0}")]
    Endpoint(String),
}

/// A service endpoint: the unit the middleware wrap.
pub type Endpoint<Req, Resp> = Arc<dyn Fn(&Context, Req) -> Result<Resp, DtxError> + Send + Sync>;

/// Reject a correlation id that was already processed.
pub fn idempotence<Req, Resp>(
    oncer: Arc<dyn Oncer>,
) -> impl Fn(Endpoint<Req, Resp>) -> Endpoint<Req, Resp>
where
    Req: 'static,
    Resp: 'static,
{
    move |next: Endpoint<Req, Resp>| -> Endpoint<Req, Resp> {
        let oncer = oncer.clone();
        Arc::new(move |ctx: &Context, request: Req| {
            let Some(id) = ctx.correlation_id() else {
                return next(ctx, request);
            };
            if oncer.once(ctx, id.as_str())? {
                return Err(DtxError::NonIdempotent(id.to_string()));
            }
            next(ctx, request)
        })
    }
}

/// Hold the correlation-id lock around the endpoint call.
pub fn lock<Req, Resp>(
    locker: Arc<dyn Locker>,
) -> impl Fn(Endpoint<Req, Resp>) -> Endpoint<Req, Resp>
where
    Req: 'static,
    Resp: 'static,
{
    move |next: Endpoint<Req, Resp>| -> Endpoint<Req, Resp> {
        let locker = locker.clone();
        Arc::new(move |ctx: &Context, request: Req| {
            let Some(id) = ctx.correlation_id() else {
                return next(ctx, request);
            };

            locker.lock(ctx, id.as_str())?;
            let result = next(ctx, request);
            if let Err(error) = locker.unlock(ctx, id.as_str()) {
                warn!(correlation_id = %id, error = %error, "unlock failed");
            }
            result
        })
    }
}

/// Mark the attempt; short-circuit to an empty response when the
/// transaction was already cancelled (resource non-suspension).
pub fn attempt<Req, Resp>(
    sequencer: Arc<dyn Sequencer>,
) -> impl Fn(Endpoint<Req, Resp>) -> Endpoint<Req, Resp>
where
    Req: 'static,
    Resp: Default + 'static,
{
    move |next: Endpoint<Req, Resp>| -> Endpoint<Req, Resp> {
        let sequencer = sequencer.clone();
        Arc::new(move |ctx: &Context, request: Req| {
            let Some(id) = ctx.correlation_id() else {
                return next(ctx, request);
            };
            if sequencer.mark_attempted_check_cancelled(ctx, id.as_str())? {
                return Ok(Resp::default());
            }
            next(ctx, request)
        })
    }
}

/// Mark the cancellation; short-circuit to an empty response when the
/// transaction was never attempted (null compensation).
pub fn cancel<Req, Resp>(
    sequencer: Arc<dyn Sequencer>,
) -> impl Fn(Endpoint<Req, Resp>) -> Endpoint<Req, Resp>
where
    Req: 'static,
    Resp: Default + 'static,
{
    move |next: Endpoint<Req, Resp>| -> Endpoint<Req, Resp> {
        let sequencer = sequencer.clone();
        Arc::new(move |ctx: &Context, request: Req| {
            let Some(id) = ctx.correlation_id() else {
                return next(ctx, request);
            };
            if !sequencer.mark_cancelled_check_attempted(ctx, id.as_str())? {
                return Ok(Resp::default());
            }
            next(ctx, request)
        })
    }
}
