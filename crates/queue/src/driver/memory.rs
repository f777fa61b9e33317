//! In-process queue driver for tests/dev.
//!
//! All five channels live behind a single mutex; a condvar wakes blocked
//! `pop` calls on pushes. Time-based promotion happens inside `pop`, the
//! same place the Redis driver does it, so the two stay interchangeable.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use trellis_core::Context;

use crate::backoff;
use crate::event::PersistedEvent;

use super::{Channel, Driver, DriverError, MAX_PROMOTIONS_PER_POP, QueueInfo, reloadable};

/// How long one blocking wait slice lasts; short enough to keep delayed
/// promotion and cancellation timely.
const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct State {
    waiting: VecDeque<PersistedEvent>,
    delayed: Vec<(Instant, PersistedEvent)>,
    reserved: Vec<(Instant, PersistedEvent)>,
    timeout: VecDeque<PersistedEvent>,
    failed: VecDeque<PersistedEvent>,
    closed: bool,
}

impl State {
    /// Promote due delayed entries to waiting and expired reservations to
    /// timeout. Batched like the Redis scripts.
    fn promote(&mut self) {
        let now = Instant::now();

        let mut promoted = 0;
        let mut index = 0;
        while index < self.delayed.len() && promoted < MAX_PROMOTIONS_PER_POP {
            if self.delayed[index].0 <= now {
                let (_, event) = self.delayed.remove(index);
                self.waiting.push_back(event);
                promoted += 1;
            } else {
                index += 1;
            }
        }

        let mut index = 0;
        while index < self.reserved.len() {
            if self.reserved[index].0 <= now {
                let (_, event) = self.reserved.remove(index);
                self.timeout.push_back(event);
            } else {
                index += 1;
            }
        }
    }

    fn remove_reserved(&mut self, unique_id: &str) {
        self.reserved.retain(|(_, e)| e.unique_id != unique_id);
    }
}

/// In-process [`Driver`].
#[derive(Debug)]
pub struct MemoryDriver {
    state: Mutex<State>,
    ready: Condvar,
    pop_timeout: Duration,
}

impl MemoryDriver {
    pub fn new(pop_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            ready: Condvar::new(),
            pop_timeout,
        }
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl Driver for MemoryDriver {
    fn push(
        &self,
        _ctx: &Context,
        event: PersistedEvent,
        delay: Duration,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(DriverError::Closed);
        }

        if delay.is_zero() {
            state.waiting.push_back(event);
            self.ready.notify_one();
        } else {
            state.delayed.push((Instant::now() + delay, event));
        }
        Ok(())
    }

    fn pop(&self, ctx: &Context) -> Result<PersistedEvent, DriverError> {
        let deadline = Instant::now() + self.pop_timeout;
        let mut state = self.state.lock().unwrap();

        loop {
            if state.closed {
                return Err(DriverError::Closed);
            }

            state.promote();

            if let Some(event) = state.waiting.pop_front() {
                state
                    .reserved
                    .push((Instant::now() + event.handle_timeout, event.clone()));
                return Ok(event);
            }

            let now = Instant::now();
            if ctx.is_cancelled() || now >= deadline {
                return Err(DriverError::Empty);
            }

            let wait = (deadline - now).min(WAIT_SLICE);
            let (guard, _) = self.ready.wait_timeout(state, wait).unwrap();
            state = guard;
        }
    }

    fn ack(&self, _ctx: &Context, event: &PersistedEvent) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(DriverError::Closed);
        }
        state.remove_reserved(&event.unique_id);
        Ok(())
    }

    fn fail(&self, _ctx: &Context, event: &PersistedEvent) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(DriverError::Closed);
        }

        state.remove_reserved(&event.unique_id);
        let mut failed = event.clone();
        failed.attempts += 1;
        state.failed.push_back(failed);
        Ok(())
    }

    fn retry(&self, _ctx: &Context, event: &PersistedEvent) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(DriverError::Closed);
        }

        state.remove_reserved(&event.unique_id);
        let mut retried = event.clone();
        retried.backoff = backoff::next(event.backoff);
        retried.attempts += 1;
        let ready_at = Instant::now() + retried.backoff;
        state.delayed.push((ready_at, retried));
        Ok(())
    }

    fn reload(&self, _ctx: &Context, channel: Channel) -> Result<u64, DriverError> {
        reloadable(channel)?;

        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(DriverError::Closed);
        }

        let source = match channel {
            Channel::Failed => std::mem::take(&mut state.failed),
            Channel::Timeout => std::mem::take(&mut state.timeout),
            _ => unreachable!(),
        };
        let moved = source.len() as u64;
        state.waiting.extend(source);
        if moved > 0 {
            self.ready.notify_all();
        }
        Ok(moved)
    }

    fn flush(&self, _ctx: &Context, channel: Channel) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(DriverError::Closed);
        }

        match channel {
            Channel::Waiting => state.waiting.clear(),
            Channel::Delayed => state.delayed.clear(),
            Channel::Reserved => state.reserved.clear(),
            Channel::Timeout => state.timeout.clear(),
            Channel::Failed => state.failed.clear(),
        }
        Ok(())
    }

    fn info(&self, _ctx: &Context) -> Result<QueueInfo, DriverError> {
        let state = self.state.lock().unwrap();
        if state.closed {
            return Err(DriverError::Closed);
        }

        Ok(QueueInfo {
            waiting: state.waiting.len() as u64,
            delayed: state.delayed.len() as u64,
            reserved: state.reserved.len() as u64,
            timeout: state.timeout.len() as u64,
            failed: state.failed.len() as u64,
        })
    }

    fn close(&self) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.ready.notify_all();
        Ok(())
    }
}
