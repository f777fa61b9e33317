//! Run-group lifecycle.
//!
//! Long-running actors (queue consumers, election campaigns, recovery
//! tickers, metric reporters) register as a run hook plus an optional
//! close hook. The group runs every hook on its own named thread and
//! treats them as one unit: the first hook to return, or cancellation of
//! the caller's context, brings the whole group down. Close hooks run in
//! reverse registration order once every run hook has exited.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::context::Context;

/// How often the group re-checks the caller's context for cancellation.
const SUPERVISE_SLICE: Duration = Duration::from_millis(50);

type RunHook = Box<dyn FnOnce(Context) + Send>;
type CloseHook = Box<dyn FnOnce(Context) + Send>;

struct Hook {
    name: String,
    run: RunHook,
    close: Option<CloseHook>,
}

/// A set of run/close hook pairs driven as one unit.
#[derive(Default)]
pub struct RunGroup {
    hooks: Vec<Hook>,
}

impl RunGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run hook. It receives a context that is cancelled when
    /// the group shuts down and is expected to return promptly after.
    pub fn add<R>(&mut self, name: impl Into<String>, run: R)
    where
        R: FnOnce(Context) + Send + 'static,
    {
        self.hooks.push(Hook {
            name: name.into(),
            run: Box::new(run),
            close: None,
        });
    }

    /// Register a run hook plus a close hook. Close hooks run after every
    /// run hook has exited, in reverse registration order.
    pub fn add_with_close<R, C>(&mut self, name: impl Into<String>, run: R, close: C)
    where
        R: FnOnce(Context) + Send + 'static,
        C: FnOnce(Context) + Send + 'static,
    {
        self.hooks.push(Hook {
            name: name.into(),
            run: Box::new(run),
            close: Some(Box::new(close)),
        });
    }

    /// Run the group. Blocks until the caller's context is cancelled or
    /// any run hook returns, then cancels the group context, joins every
    /// thread, and runs the close hooks.
    pub fn run(self, ctx: &Context) {
        let (group_ctx, group_token) = Context::cancellable();
        let (done_tx, done_rx) = mpsc::channel::<String>();

        let mut joins = Vec::with_capacity(self.hooks.len());
        let mut closes = Vec::new();

        for hook in self.hooks {
            if let Some(close) = hook.close {
                closes.push((hook.name.clone(), close));
            }

            let run = hook.run;
            let hook_ctx = group_ctx.clone();
            let done = done_tx.clone();
            let name = hook.name.clone();
            let join = thread::Builder::new()
                .name(hook.name.clone())
                .spawn(move || {
                    run(hook_ctx);
                    let _ = done.send(name);
                })
                .expect("failed to spawn run group thread");
            joins.push(join);
        }
        drop(done_tx);

        info!(hooks = joins.len(), "run group started");

        loop {
            match done_rx.recv_timeout(SUPERVISE_SLICE) {
                Ok(name) => {
                    info!(hook = %name, "run hook exited, shutting group down");
                    break;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if ctx.err().is_err() {
                        info!("run group cancelled");
                        break;
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        group_token.cancel();
        for join in joins {
            if join.join().is_err() {
                warn!("run hook panicked during shutdown");
            }
        }

        let close_ctx = Context::background();
        for (name, close) in closes.into_iter().rev() {
            info!(hook = %name, "running close hook");
            close(close_ctx.clone());
        }

        info!("run group stopped");
    }
}
