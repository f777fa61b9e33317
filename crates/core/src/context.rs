//! Cancellation-aware execution context.
//!
//! Every blocking operation in the toolkit accepts a [`Context`]: a shared
//! cancellation token, an optional deadline, and a correlation-id slot for
//! distributed-transaction participants. Child contexts share the parent
//! token, so cancelling a root interrupts the whole tree; deadlines only
//! ever tighten.
//!
//! Cancellation is cooperative: long waits go through [`Context::sleep`] or
//! the token's condvar so a `cancel()` from another thread wakes them
//! promptly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::id::CorrelationId;

/// Why a context is no longer live.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    #[error("context cancelled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug)]
struct TokenState {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

/// Shared cancellation signal.
///
/// Cloning yields a handle to the same signal. `cancel()` is idempotent and
/// wakes every waiter.
#[derive(Debug, Clone)]
pub struct CancelToken {
    state: Arc<TokenState>,
}

impl CancelToken {
    fn new() -> Self {
        Self {
            state: Arc::new(TokenState {
                cancelled: AtomicBool::new(false),
                lock: Mutex::new(()),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        let _guard = self.state.lock.lock().unwrap();
        self.state.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Block for up to `timeout` or until cancelled. Returns true if the
    /// token was cancelled.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let guard = self.state.lock.lock().unwrap();
        let (_guard, _result) = self.state.cond.wait_timeout(guard, timeout).unwrap();
        self.is_cancelled()
    }
}

/// Execution context threaded through every operation in the toolkit.
///
/// Immutable after construction; derive children with the `with_*` methods.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancelToken,
    deadline: Option<Instant>,
    correlation_id: Option<CorrelationId>,
}

impl Context {
    /// A root context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            token: CancelToken::new(),
            deadline: None,
            correlation_id: None,
        }
    }

    /// A root context plus the token that cancels it.
    pub fn cancellable() -> (Self, CancelToken) {
        let ctx = Self::background();
        let token = ctx.token.clone();
        (ctx, token)
    }

    /// Child context whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Child context with the given deadline (never looser than the parent's).
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) => Some(parent.min(deadline)),
            None => Some(deadline),
        };
        Self {
            token: self.token.clone(),
            deadline,
            correlation_id: self.correlation_id.clone(),
        }
    }

    /// Child context carrying the given correlation id.
    pub fn with_correlation_id(&self, id: CorrelationId) -> Self {
        Self {
            token: self.token.clone(),
            deadline: self.deadline,
            correlation_id: Some(id),
        }
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline. `None` means unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.err().is_err()
    }

    /// `Ok(())` while the context is live, otherwise the reason it is not.
    pub fn err(&self) -> Result<(), ContextError> {
        if self.token.is_cancelled() {
            return Err(ContextError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(ContextError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Sleep for `duration`, waking early on cancellation or deadline.
    pub fn sleep(&self, duration: Duration) -> Result<(), ContextError> {
        let start = Instant::now();
        loop {
            self.err()?;
            let elapsed = start.elapsed();
            if elapsed >= duration {
                return Ok(());
            }
            let mut wait = duration - elapsed;
            if let Some(remaining) = self.remaining() {
                wait = wait.min(remaining);
            }
            if self.token.wait(wait) {
                return Err(ContextError::Cancelled);
            }
        }
    }
}
