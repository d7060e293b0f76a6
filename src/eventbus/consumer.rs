//! Typed consumer handles.

use super::message::{Message, RawMessage};
use super::registration::{RawHandler, Registration};
use crate::context::Context;
use crate::streams::{Handler, ReadStream, Signal};
use crate::types::Result;
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// A consumer of messages with bodies of type `T` at one address.
///
/// Created by [`EventBus::consumer`](super::EventBus::consumer). It registers
/// on the bus once a handler is attached and delivers every message on the
/// context it was created for.
pub struct MessageConsumer<T> {
    registration: Arc<Registration>,
    _body: PhantomData<fn() -> T>,
}

impl<T> Clone for MessageConsumer<T> {
    fn clone(&self) -> Self {
        Self {
            registration: Arc::clone(&self.registration),
            _body: PhantomData,
        }
    }
}

impl<T> fmt::Debug for MessageConsumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageConsumer")
            .field("registration", &self.registration)
            .finish()
    }
}

/// Wrap a typed handler for the untyped mailbox. A body of the wrong type
/// fails the sender's request instead of reaching the handler.
fn typed<T, F>(handler: F) -> RawHandler
where
    T: Any + Send + Sync,
    F: Fn(Message<T>) + Send + Sync + 'static,
{
    Arc::new(move |raw: RawMessage| match raw.into_typed::<T>() {
        Ok(message) => handler(message),
        Err(raw) => {
            tracing::warn!(
                address = %raw.meta.address,
                "Message body is not a {}",
                std::any::type_name::<T>()
            );
            let _ = raw.meta.fail(
                -1,
                format!("unexpected body type, expected {}", std::any::type_name::<T>()),
            );
        }
    })
}

impl<T: Any + Send + Sync> MessageConsumer<T> {
    pub(crate) fn new(registration: Arc<Registration>) -> Self {
        Self {
            registration,
            _body: PhantomData,
        }
    }

    /// Attach a handler, registering the consumer if this is the first one.
    pub fn on_message<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(Message<T>) + Send + Sync + 'static,
    {
        self.registration.set_handler(Some(typed(handler)))
    }

    pub fn address(&self) -> &str {
        self.registration.address()
    }

    pub fn context(&self) -> &Context {
        self.registration.context()
    }

    pub fn is_local_only(&self) -> bool {
        self.registration.is_local_only()
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_registered()
    }

    /// Called for each message dropped because the paused buffer is full.
    pub fn discard_handler<F>(&self, handler: F)
    where
        F: Fn(Message<T>) + Send + Sync + 'static,
    {
        self.registration.discard_handler(Some(typed(handler)));
    }

    pub fn clear_discard_handler(&self) {
        self.registration.discard_handler(None);
    }

    pub fn max_buffered_messages(&self) -> usize {
        self.registration.max_buffered_messages()
    }

    /// Cap the paused buffer. Lowering it discards the oldest messages.
    pub fn set_max_buffered_messages(&self, max: usize) {
        self.registration.set_max_buffered_messages(max);
    }

    pub fn buffered_count(&self) -> usize {
        self.registration.buffered()
    }

    /// Called on the consumer's context once registration completes.
    pub fn completion_handler<F>(&self, handler: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.registration.completion_handler(Box::new(handler));
    }

    /// Unregister. Returns false if already unregistered.
    pub fn unregister(&self) -> bool {
        self.registration.unregister(None)
    }

    /// Unregister and call `completion` on the consumer's context. The
    /// callback is dropped without being called if already unregistered.
    pub fn unregister_with<F>(&self, completion: F) -> bool
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.registration.unregister(Some(Box::new(completion)))
    }

    /// A stream of bare bodies sharing this consumer's registration.
    pub fn body_stream(&self) -> BodyStream<T> {
        BodyStream {
            consumer: self.clone(),
        }
    }
}

impl<T: Any + Send + Sync> ReadStream<Message<T>> for MessageConsumer<T> {
    fn handler(&self, handler: Option<Handler<Message<T>>>) -> Result<()> {
        match handler {
            Some(handler) => self.on_message(move |message| handler(message)),
            None => self.registration.set_handler(None),
        }
    }

    fn pause(&self) {
        self.registration.pause();
    }

    fn resume(&self) {
        self.registration.resume();
    }

    fn end_handler(&self, handler: Option<Signal>) {
        self.registration.end_handler(handler);
    }
}

/// Bodies of a [`MessageConsumer`], without the envelope.
pub struct BodyStream<T> {
    consumer: MessageConsumer<T>,
}

impl<T> fmt::Debug for BodyStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyStream")
            .field("consumer", &self.consumer)
            .finish()
    }
}

impl<T: Any + Send + Sync> ReadStream<T> for BodyStream<T> {
    fn handler(&self, handler: Option<Handler<T>>) -> Result<()> {
        match handler {
            Some(handler) => self
                .consumer
                .on_message(move |message| handler(message.into_body())),
            None => self.consumer.registration.set_handler(None),
        }
    }

    fn pause(&self) {
        self.consumer.pause();
    }

    fn resume(&self) {
        self.consumer.resume();
    }

    fn end_handler(&self, handler: Option<Signal>) {
        self.consumer.end_handler(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Config, RuntimeConfig};
    use crate::Courier;
    use std::sync::mpsc;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn start_courier() -> Courier {
        Courier::new(Config {
            runtime: RuntimeConfig {
                event_loop_pool_size: 1,
                worker_pool_size: 2,
                ..RuntimeConfig::default()
            },
            ..Config::default()
        })
        .unwrap()
    }

    fn flush(context: &Context) {
        let (tx, rx) = mpsc::channel();
        context.run_on_context(move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    #[traced_test]
    fn test_discard_without_handler_is_logged() {
        let courier = start_courier();
        let bus = courier.event_bus();
        let ctx = courier.create_event_loop_context().unwrap();

        let consumer = bus.consumer::<i32>(&ctx, "quiet").unwrap();
        consumer.on_message(|_m| {}).unwrap();
        consumer.pause();
        for n in 0..3 {
            bus.send("quiet", n).unwrap();
        }
        flush(&ctx);

        // Trimming runs on this thread, so the warning is captured here
        consumer.set_max_buffered_messages(1);
        assert_eq!(consumer.buffered_count(), 1);
        assert!(logs_contain("Discarding message"));
        assert_eq!(bus.stats().messages_discarded, 2);
        courier.close();
    }

    #[test]
    fn test_clearing_handler_before_registration_keeps_consumer_usable() {
        let courier = start_courier();
        let bus = courier.event_bus();
        let ctx = courier.create_event_loop_context().unwrap();
        let (tx, rx) = mpsc::channel();

        let consumer = bus.consumer::<i32>(&ctx, "fresh").unwrap();
        ReadStream::handler(&consumer, None).unwrap();
        consumer.body_stream().handler(None).unwrap();
        assert!(!consumer.is_registered());

        consumer
            .on_message(move |m| {
                let _ = tx.send(*m.body());
            })
            .unwrap();
        assert!(consumer.is_registered());
        bus.send("fresh", 11).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 11);

        ReadStream::handler(&consumer, None).unwrap();
        assert!(!consumer.is_registered());
        assert!(consumer.on_message(|_m| {}).is_err());
        courier.close();
    }

    #[test]
    fn test_unregister_releases_close_hook() {
        let courier = start_courier();
        let bus = courier.event_bus();
        let ctx = courier.create_event_loop_context().unwrap();

        let consumer = bus.consumer::<i32>(&ctx, "hooked").unwrap();
        assert_eq!(ctx.close_hook_count(), 0);
        consumer.on_message(|_m| {}).unwrap();
        assert_eq!(ctx.close_hook_count(), 1);
        assert!(consumer.unregister());
        assert_eq!(ctx.close_hook_count(), 0);
        courier.close();
    }

    #[test]
    fn test_body_stream_shares_registration() {
        let courier = start_courier();
        let bus = courier.event_bus();
        let ctx = courier.create_event_loop_context().unwrap();
        let (tx, rx) = mpsc::channel();

        let consumer = bus.consumer::<String>(&ctx, "bodies").unwrap();
        let bodies = consumer.body_stream();
        bodies
            .handler(Some(Arc::new(move |body: String| {
                let _ = tx.send(body);
            })))
            .unwrap();
        assert!(consumer.is_registered());

        bus.send("bodies", "plain".to_string()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "plain");

        bodies.handler(None).unwrap();
        assert!(!consumer.is_registered());
        courier.close();
    }
}
