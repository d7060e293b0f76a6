//! Credit-based message producer.
//!
//! A producer owns a private credit address. Every message it sends carries
//! that address in the [`CREDIT_ADDRESS_HEADER`] header; the receiving
//! consumer sends one credit back as it hands each message to its handler.
//! Without credits, writes queue locally until credits come back.

use super::consumer::MessageConsumer;
use super::message::DeliveryOptions;
use super::EventBus;
use crate::context::Context;
use crate::streams::{Signal, WriteStream};
use crate::types::{Error, Result};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

/// Header naming the address credits are returned to.
pub const CREDIT_ADDRESS_HEADER: &str = "__courier.credit";

struct ProducerState<T> {
    max_size: usize,
    credits: usize,
    pending: VecDeque<T>,
    drain_handler: Option<Signal>,
    closed: bool,
}

struct ProducerInner<T> {
    bus: EventBus,
    address: String,
    options: DeliveryOptions,
    context: Context,
    credits: MessageConsumer<i32>,
    state: Mutex<ProducerState<T>>,
}

impl<T> Drop for ProducerInner<T> {
    fn drop(&mut self) {
        self.credits.unregister();
    }
}

/// A [`WriteStream`] sending each item to one address.
pub struct MessageProducer<T> {
    inner: Arc<ProducerInner<T>>,
}

impl<T> Clone for MessageProducer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for MessageProducer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MessageProducer")
            .field("address", &self.inner.address)
            .field("credits", &state.credits)
            .field("queued", &state.pending.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T: Any + Send + Sync> MessageProducer<T> {
    pub(crate) fn new(
        bus: EventBus,
        context: &Context,
        address: &str,
        options: DeliveryOptions,
        max_credits: usize,
    ) -> Result<Self> {
        let credit_address = uuid::Uuid::new_v4().to_string();
        let mut options = options;
        options
            .headers_mut()
            .set(CREDIT_ADDRESS_HEADER, credit_address.as_str());

        let credits = bus.local_consumer::<i32>(context, &credit_address)?;
        let inner = Arc::new(ProducerInner {
            bus,
            address: address.to_string(),
            options,
            context: context.clone(),
            credits: credits.clone(),
            state: Mutex::new(ProducerState {
                max_size: max_credits,
                credits: max_credits,
                pending: VecDeque::new(),
                drain_handler: None,
                closed: false,
            }),
        });

        let weak: Weak<ProducerInner<T>> = Arc::downgrade(&inner);
        credits.on_message(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.on_credit(*message.body());
            }
        })?;

        tracing::debug!(address = %address, credit_address = %credit_address, "Created message producer");
        Ok(Self { inner })
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Credits left before writes start queueing.
    pub fn credits(&self) -> usize {
        self.inner.state.lock().credits
    }

    /// Items waiting for credits.
    pub fn queued(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Stop accepting writes and unregister the credit consumer. Queued
    /// items are dropped.
    pub fn close(&self) {
        let dropped = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.drain_handler = None;
            std::mem::take(&mut state.pending).len()
        };
        if dropped > 0 {
            tracing::debug!(address = %self.inner.address, "Closing producer with {} queued items", dropped);
        }
        self.inner.credits.unregister();
    }
}

impl<T: Any + Send + Sync> ProducerInner<T> {
    fn send(&self, item: T) -> Result<()> {
        self.bus.send_with(&self.address, item, &self.options)
    }

    fn on_credit(&self, amount: i32) {
        let (ready, drain) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.credits += usize::try_from(amount).unwrap_or(0);
            let mut ready = Vec::new();
            while state.credits > 0 {
                match state.pending.pop_front() {
                    Some(item) => {
                        state.credits -= 1;
                        ready.push(item);
                    }
                    None => break,
                }
            }
            let drain = if state.pending.is_empty() && state.credits >= state.max_size / 2 {
                state.drain_handler.take()
            } else {
                None
            };
            (ready, drain)
        };

        for item in ready {
            if let Err(e) = self.send(item) {
                tracing::warn!(address = %self.address, "Failed to send queued item: {}", e);
            }
        }
        if let Some(drain) = drain {
            drain();
        }
    }
}

impl<T: Any + Send + Sync> WriteStream<T> for MessageProducer<T> {
    fn write(&self, item: T) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::illegal_state(format!(
                    "producer for {} is closed",
                    self.inner.address
                )));
            }
            if state.credits == 0 || !state.pending.is_empty() {
                state.pending.push_back(item);
                return Ok(());
            }
            state.credits -= 1;
        }
        self.inner.send(item)
    }

    /// Resize the credit window. Outstanding credits move by the difference.
    fn set_write_queue_max_size(&self, max_size: usize) {
        let mut state = self.inner.state.lock();
        if max_size >= state.max_size {
            state.credits += max_size - state.max_size;
        } else {
            state.credits = state.credits.saturating_sub(state.max_size - max_size);
        }
        state.max_size = max_size;
    }

    fn write_queue_full(&self) -> bool {
        self.inner.state.lock().credits == 0
    }

    fn drain_handler(&self, handler: Option<Signal>) {
        let fire_now = {
            let mut state = self.inner.state.lock();
            match handler {
                Some(handler) if state.pending.is_empty() && state.credits >= state.max_size / 2 && state.credits > 0 => {
                    Some(handler)
                }
                other => {
                    state.drain_handler = other;
                    None
                }
            }
        };
        if let Some(handler) = fire_now {
            self.inner.context.run_on_context(handler);
        }
    }

    fn end(&self) {
        self.close();
    }
}
