//! Timer table and timer streams.
//!
//! Timers wake on the owning context's event loop and fire through
//! [`Context::run_on_context`], so handlers observe the same ordering as any
//! other task on that context. Every timer registers a close hook: closing the
//! context cancels whatever is still outstanding.

use super::Context;
use crate::streams::{Handler, ReadStream};
use crate::types::{Error, HookId, Result, TimerId};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const MIN_DELAY: Duration = Duration::from_millis(1);

struct TimerEntry {
    token: CancellationToken,
    context: Context,
    hook: Option<HookId>,
}

/// All outstanding timers, keyed by id.
pub struct TimerTable {
    next_id: AtomicU64,
    timers: DashMap<TimerId, TimerEntry>,
}

impl fmt::Debug for TimerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerTable")
            .field("outstanding", &self.timers.len())
            .finish()
    }
}

impl TimerTable {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(0),
            timers: DashMap::new(),
        })
    }

    /// Fire `handler` once on `context` after `delay`.
    pub fn set_timer<F>(self: &Arc<Self>, context: &Context, delay: Duration, handler: F) -> Result<TimerId>
    where
        F: FnOnce(TimerId) + Send + 'static,
    {
        let (id, token) = self.schedule(context, delay)?;
        let table = Arc::downgrade(self);
        let ctx = context.clone();

        context.event_loop().handle().spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(delay) => {
                    ctx.run_on_context(move || {
                        let fired = table.upgrade().map(|t| t.take(id)).unwrap_or(false);
                        if fired {
                            handler(id);
                        }
                    });
                }
            }
        });
        Ok(id)
    }

    /// Fire `handler` on `context` every `delay` until cancelled.
    pub fn set_periodic<F>(self: &Arc<Self>, context: &Context, delay: Duration, handler: F) -> Result<TimerId>
    where
        F: FnMut(TimerId) + Send + 'static,
    {
        let (id, token) = self.schedule(context, delay)?;
        let table = Arc::downgrade(self);
        let ctx = context.clone();
        let handler = Arc::new(Mutex::new(handler));

        context.event_loop().handle().spawn(async move {
            let mut ticker = interval_at(Instant::now() + delay, delay);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let table = table.clone();
                        let handler = Arc::clone(&handler);
                        ctx.run_on_context(move || {
                            let live = table.upgrade().map(|t| t.contains(id)).unwrap_or(false);
                            if live {
                                let mut handler = handler.lock();
                                (*handler)(id);
                            }
                        });
                    }
                }
            }
        });
        Ok(id)
    }

    /// Cancel a timer. Returns false if it is unknown or already fired.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        match self.timers.remove(&id) {
            Some((_, entry)) => {
                entry.token.cancel();
                if let Some(hook) = entry.hook {
                    entry.context.remove_close_hook(hook);
                }
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    fn schedule(self: &Arc<Self>, context: &Context, delay: Duration) -> Result<(TimerId, CancellationToken)> {
        if delay < MIN_DELAY {
            return Err(Error::illegal_argument(format!(
                "cannot schedule a timer with delay < 1 ms (got {:?})",
                delay
            )));
        }
        let id = TimerId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let token = CancellationToken::new();
        self.timers.insert(
            id,
            TimerEntry {
                token: token.clone(),
                context: context.clone(),
                hook: None,
            },
        );

        let table = Arc::downgrade(self);
        let hook = context.add_close_hook(move || {
            if let Some(table) = table.upgrade() {
                table.cancel_timer(id);
            }
        });
        match hook {
            Ok(hook) => {
                if let Some(mut entry) = self.timers.get_mut(&id) {
                    entry.hook = Some(hook);
                }
                Ok((id, token))
            }
            Err(e) => {
                self.timers.remove(&id);
                Err(e)
            }
        }
    }

    /// Remove a one-shot timer at fire time.
    fn take(&self, id: TimerId) -> bool {
        match self.timers.remove(&id) {
            Some((_, entry)) => {
                if let Some(hook) = entry.hook {
                    entry.context.remove_close_hook(hook);
                }
                true
            }
            None => false,
        }
    }
}

// =============================================================================
// TimeoutStream
// =============================================================================

struct TimeoutState {
    timer: Option<TimerId>,
    handler: Option<Handler<TimerId>>,
    end_handler: Option<Box<dyn FnOnce() + Send>>,
    paused: bool,
}

struct TimeoutInner {
    table: Weak<TimerTable>,
    context: Context,
    delay: Duration,
    periodic: bool,
    state: Mutex<TimeoutState>,
}

/// A [`ReadStream`] of timer events.
///
/// The timer is scheduled when a handler is attached and cancelled when the
/// handler is cleared. Events arriving while paused are skipped.
#[derive(Clone)]
pub struct TimeoutStream {
    inner: Arc<TimeoutInner>,
}

impl fmt::Debug for TimeoutStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutStream")
            .field("delay", &self.inner.delay)
            .field("periodic", &self.inner.periodic)
            .field("timer", &self.inner.state.lock().timer)
            .finish()
    }
}

impl TimeoutStream {
    pub(crate) fn new(table: &Arc<TimerTable>, context: Context, delay: Duration, periodic: bool) -> Self {
        Self {
            inner: Arc::new(TimeoutInner {
                table: Arc::downgrade(table),
                context,
                delay,
                periodic,
                state: Mutex::new(TimeoutState {
                    timer: None,
                    handler: None,
                    end_handler: None,
                    paused: false,
                }),
            }),
        }
    }

    /// Id of the scheduled timer, once a handler has been attached.
    pub fn timer_id(&self) -> Option<TimerId> {
        self.inner.state.lock().timer
    }

    fn cancel(&self) {
        let timer = self.inner.state.lock().timer.take();
        if let (Some(id), Some(table)) = (timer, self.inner.table.upgrade()) {
            table.cancel_timer(id);
        }
    }
}

impl TimeoutInner {
    fn fire(&self, id: TimerId) {
        let (handler, end_handler) = {
            let mut state = self.state.lock();
            let handler = if state.paused { None } else { state.handler.clone() };
            let end_handler = if self.periodic {
                None
            } else {
                state.timer = None;
                state.handler = None;
                state.end_handler.take()
            };
            (handler, end_handler)
        };
        if let Some(handler) = handler {
            handler(id);
        }
        if let Some(end_handler) = end_handler {
            end_handler();
        }
    }
}

impl ReadStream<TimerId> for TimeoutStream {
    fn handler(&self, handler: Option<Handler<TimerId>>) -> Result<()> {
        let Some(handler) = handler else {
            self.cancel();
            return Ok(());
        };

        let mut state = self.inner.state.lock();
        state.handler = Some(handler);
        if state.timer.is_some() {
            return Ok(());
        }
        let table = self
            .inner
            .table
            .upgrade()
            .ok_or_else(|| Error::illegal_state("timer table is gone"))?;
        let weak = Arc::downgrade(&self.inner);
        let id = if self.inner.periodic {
            table.set_periodic(&self.inner.context, self.inner.delay, move |id| {
                if let Some(inner) = weak.upgrade() {
                    inner.fire(id);
                }
            })?
        } else {
            table.set_timer(&self.inner.context, self.inner.delay, move |id| {
                if let Some(inner) = weak.upgrade() {
                    inner.fire(id);
                }
            })?
        };
        state.timer = Some(id);
        Ok(())
    }

    fn pause(&self) {
        self.inner.state.lock().paused = true;
    }

    fn resume(&self) {
        self.inner.state.lock().paused = false;
    }

    fn end_handler(&self, handler: Option<Box<dyn FnOnce() + Send>>) {
        self.inner.state.lock().end_handler = handler;
    }
}
