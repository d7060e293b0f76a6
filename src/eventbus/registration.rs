//! Per-address, per-context mailbox.
//!
//! ```text
//!   Idle ──handler──▶ Registered ◀──pause/resume──▶ (paused)
//!     │                   │
//!     └──unregister──▶ Unregistered (terminal)
//! ```
//!
//! All state lives behind one mutex, released before any user callback runs.
//! Lock order: registration, then the address table, then context hooks.

use super::message::RawMessage;
use super::producer::CREDIT_ADDRESS_HEADER;
use super::BusInner;
use crate::context::Context;
use crate::types::{panic_message, Error, HookId, Result, TimerId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

pub(crate) type RawHandler = Arc<dyn Fn(RawMessage) + Send + Sync>;
pub(crate) type Completion = Box<dyn FnOnce(Result<()>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Registered,
    Unregistered,
}

struct RegistrationState {
    lifecycle: Lifecycle,
    handler: Option<RawHandler>,
    paused: bool,
    pending: VecDeque<RawMessage>,
    max_buffered: usize,
    drain_scheduled: bool,
    discard_handler: Option<RawHandler>,
    end_handler: Option<Box<dyn FnOnce() + Send>>,
    completion_handler: Option<Completion>,
    timeout_timer: Option<TimerId>,
    close_hook: Option<HookId>,
}

pub(crate) struct Registration {
    address: String,
    context: Context,
    bus: Weak<BusInner>,
    local_only: bool,
    state: Mutex<RegistrationState>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Registration")
            .field("address", &self.address)
            .field("context", self.context.id())
            .field("lifecycle", &state.lifecycle)
            .field("paused", &state.paused)
            .field("buffered", &state.pending.len())
            .finish()
    }
}

impl Registration {
    pub(crate) fn new(
        address: String,
        context: Context,
        bus: Weak<BusInner>,
        local_only: bool,
        max_buffered: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            address,
            context,
            bus,
            local_only,
            state: Mutex::new(RegistrationState {
                lifecycle: Lifecycle::Idle,
                handler: None,
                paused: false,
                pending: VecDeque::new(),
                max_buffered,
                drain_scheduled: false,
                discard_handler: None,
                end_handler: None,
                completion_handler: None,
                timeout_timer: None,
                close_hook: None,
            }),
        })
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    pub(crate) fn context(&self) -> &Context {
        &self.context
    }

    pub(crate) fn is_local_only(&self) -> bool {
        self.local_only
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.state.lock().lifecycle == Lifecycle::Registered
    }

    fn bus(&self) -> Result<Arc<BusInner>> {
        self.bus
            .upgrade()
            .ok_or_else(|| Error::illegal_state("event bus is closed"))
    }

    // =========================================================================
    // Handler attachment
    // =========================================================================

    /// Attach a handler (registering on first attach) or, with `None`,
    /// unregister. Clearing a registration that never registered leaves it
    /// idle.
    pub(crate) fn set_handler(self: &Arc<Self>, handler: Option<RawHandler>) -> Result<()> {
        let Some(handler) = handler else {
            let mut state = self.state.lock();
            if state.lifecycle == Lifecycle::Idle {
                state.handler = None;
                return Ok(());
            }
            drop(state);
            self.unregister(None);
            return Ok(());
        };

        let mut state = self.state.lock();
        match state.lifecycle {
            Lifecycle::Unregistered => Err(Error::illegal_state(format!(
                "consumer for {} is already unregistered",
                self.address
            ))),
            Lifecycle::Registered => {
                state.handler = Some(handler);
                Ok(())
            }
            Lifecycle::Idle => {
                let bus = self.bus()?;
                let weak = Arc::downgrade(self);
                let hook = self.context.add_close_hook(move || {
                    if let Some(registration) = weak.upgrade() {
                        registration.unregister(None);
                    }
                })?;
                bus.handlers.add(&self.address, Arc::clone(self));
                state.close_hook = Some(hook);
                state.handler = Some(handler);
                state.lifecycle = Lifecycle::Registered;
                let completion = state.completion_handler.take();
                drop(state);

                bus.on_registered(self);
                if let Some(completion) = completion {
                    self.context.run_on_context(move || completion(Ok(())));
                }
                Ok(())
            }
        }
    }

    /// Notified once registration completes; immediately if it already has.
    pub(crate) fn completion_handler(&self, completion: Completion) {
        let mut state = self.state.lock();
        match state.lifecycle {
            Lifecycle::Idle => state.completion_handler = Some(completion),
            Lifecycle::Registered => {
                drop(state);
                self.context.run_on_context(move || completion(Ok(())));
            }
            Lifecycle::Unregistered => {
                drop(state);
                let address = self.address.clone();
                self.context.run_on_context(move || {
                    completion(Err(Error::illegal_state(format!(
                        "consumer for {} is unregistered",
                        address
                    ))))
                });
            }
        }
    }

    pub(crate) fn end_handler(&self, handler: Option<Box<dyn FnOnce() + Send>>) {
        self.state.lock().end_handler = handler;
    }

    pub(crate) fn discard_handler(&self, handler: Option<RawHandler>) {
        self.state.lock().discard_handler = handler;
    }

    /// Own a timer that is cancelled on unregister. Returns false (and the
    /// caller must cancel) when the registration is already unregistered.
    pub(crate) fn set_timeout_timer(&self, timer: TimerId) -> bool {
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Unregistered {
            return false;
        }
        state.timeout_timer = Some(timer);
        true
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Accept a message. Runs on the owning context.
    pub(crate) fn receive(self: &Arc<Self>, message: RawMessage) {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Registered {
            tracing::trace!(address = %self.address, "Dropping message for inactive consumer");
            return;
        }

        if state.paused {
            if state.pending.len() < state.max_buffered {
                state.pending.push_back(message);
            } else {
                let discard = state.discard_handler.clone();
                let max = state.max_buffered;
                drop(state);
                self.discard(discard.as_ref(), message, max);
            }
            return;
        }

        // Buffered messages go first
        let message = if state.pending.is_empty() {
            message
        } else {
            state.pending.push_back(message);
            match state.pending.pop_front() {
                Some(oldest) => oldest,
                None => return,
            }
        };
        let handler = state.handler.clone();
        self.schedule_drain(&mut state);
        drop(state);

        if let Some(handler) = handler {
            self.deliver(&handler, message);
        }
    }

    fn discard(&self, discard: Option<&RawHandler>, message: RawMessage, max: usize) {
        if let Ok(bus) = self.bus() {
            bus.on_discarded(&self.address);
        }
        match discard {
            Some(discard) => discard(message),
            None => tracing::warn!(
                address = %self.address,
                "Discarding message as more than {} buffered in paused consumer",
                max
            ),
        }
    }

    fn deliver(&self, handler: &RawHandler, message: RawMessage) {
        let bus = self.bus.upgrade();
        if let Some(credit_address) = message.headers().get(CREDIT_ADDRESS_HEADER) {
            if let Some(bus) = &bus {
                if let Err(e) = super::EventBus::from_inner(Arc::clone(bus)).send(credit_address, 1i32) {
                    tracing::warn!(address = %credit_address, "Failed to return credit: {}", e);
                }
            }
        }

        if let Some(bus) = &bus {
            bus.metrics.begin_handle_message(&self.address, true);
        }
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler(message)));
        match outcome {
            Ok(()) => {
                if let Some(bus) = &bus {
                    bus.metrics.end_handle_message(&self.address, None);
                }
            }
            Err(payload) => {
                let failure = Error::uncaught(panic_message(payload.as_ref()));
                tracing::error!(address = %self.address, "Failed to handle message: {}", failure);
                if let Some(bus) = &bus {
                    bus.metrics.end_handle_message(&self.address, Some(&failure));
                }
                std::panic::resume_unwind(payload);
            }
        }
    }

    fn schedule_drain(self: &Arc<Self>, state: &mut RegistrationState) {
        if state.paused || state.drain_scheduled || state.pending.is_empty() {
            return;
        }
        state.drain_scheduled = true;
        let registration = Arc::clone(self);
        self.context.run_on_context(move || registration.drain_one());
    }

    /// Deliver one buffered message per context tick.
    fn drain_one(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.drain_scheduled = false;
        if state.paused || state.lifecycle != Lifecycle::Registered {
            return;
        }
        let Some(message) = state.pending.pop_front() else {
            return;
        };
        let handler = state.handler.clone();
        self.schedule_drain(&mut state);
        drop(state);

        if let Some(handler) = handler {
            self.deliver(&handler, message);
        }
    }

    // =========================================================================
    // Flow control
    // =========================================================================

    pub(crate) fn pause(&self) {
        self.state.lock().paused = true;
    }

    pub(crate) fn resume(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if !state.paused {
            return;
        }
        state.paused = false;
        self.schedule_drain(&mut state);
    }

    pub(crate) fn buffered(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub(crate) fn max_buffered_messages(&self) -> usize {
        self.state.lock().max_buffered
    }

    /// Change the buffer cap, discarding the oldest messages over it.
    pub(crate) fn set_max_buffered_messages(&self, max: usize) {
        let (discard, dropped) = {
            let mut state = self.state.lock();
            state.max_buffered = max;
            let excess = state.pending.len().saturating_sub(max);
            let dropped: Vec<RawMessage> = state.pending.drain(..excess).collect();
            (state.discard_handler.clone(), dropped)
        };
        for message in dropped {
            self.discard(discard.as_ref(), message, max);
        }
    }

    // =========================================================================
    // Unregistration
    // =========================================================================

    /// Remove the registration. Only the first call has any effect; it
    /// fires the end handler and then `completion` on the owning context.
    pub(crate) fn unregister(self: &Arc<Self>, completion: Option<Completion>) -> bool {
        let bus = self.bus.upgrade();
        let (end_handler, timer, hook, was_registered) = {
            let mut state = self.state.lock();
            if state.lifecycle == Lifecycle::Unregistered {
                return false;
            }
            let was_registered = state.lifecycle == Lifecycle::Registered;
            state.lifecycle = Lifecycle::Unregistered;
            state.handler = None;
            state.discard_handler = None;
            state.completion_handler = None;
            state.pending.clear();
            if was_registered {
                if let Some(bus) = &bus {
                    bus.handlers
                        .remove(&self.address, |r| Arc::ptr_eq(r, self));
                }
            }
            (
                state.end_handler.take(),
                state.timeout_timer.take(),
                state.close_hook.take(),
                was_registered,
            )
        };

        if let Some(hook) = hook {
            self.context.remove_close_hook(hook);
        }
        if let Some(bus) = &bus {
            if let Some(timer) = timer {
                bus.timers.cancel_timer(timer);
            }
            if was_registered {
                bus.on_unregistered(self);
            }
        }

        if end_handler.is_some() || completion.is_some() {
            self.context.run_on_context(move || {
                if let Some(end_handler) = end_handler {
                    end_handler();
                }
                if let Some(completion) = completion {
                    completion(Ok(()));
                }
            });
        }
        true
    }
}
