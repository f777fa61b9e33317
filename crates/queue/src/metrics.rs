//! Queue-length metrics hook.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::warn;

use trellis_core::Context;

use crate::driver::{Driver, QueueInfo};

/// Gauge sink supplied by the application's metrics stack.
pub trait Gauge: Send + Sync {
    fn observe(&self, labels: &[(&str, &str)], value: f64);
}

/// Periodically publishes the five channel sizes of one queue.
#[derive(Debug)]
pub struct QueueLengthReporter {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl QueueLengthReporter {
    pub fn spawn(
        queue: impl Into<String>,
        driver: Arc<dyn Driver>,
        gauge: Arc<dyn Gauge>,
        interval: Duration,
    ) -> Self {
        let queue = queue.into();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let name = format!("{queue}-queue-length");
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let ctx = Context::background();
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            report(&ctx, &queue, driver.as_ref(), gauge.as_ref());
                        }
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
                    }
                }
            })
            .expect("failed to spawn queue length reporter thread");

        Self {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }

    /// Request graceful shutdown.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn report(ctx: &Context, queue: &str, driver: &dyn Driver, gauge: &dyn Gauge) {
    let info = match driver.info(ctx) {
        Ok(info) => info,
        Err(err) => {
            warn!(queue, error = %err, "queue length probe failed");
            return;
        }
    };
    observe_info(queue, &info, gauge);
}

fn observe_info(queue: &str, info: &QueueInfo, gauge: &dyn Gauge) {
    for (channel, value) in [
        ("waiting", info.waiting),
        ("delayed", info.delayed),
        ("reserved", info.reserved),
        ("timeout", info.timeout),
        ("failed", info.failed),
    ] {
        gauge.observe(&[("queue", queue), ("channel", channel)], value as f64);
    }
}
