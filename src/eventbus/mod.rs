//! Address-based message bus.
//!
//! Senders address messages by string; consumers register per address on a
//! [`Context`] and receive every message on that context.
//!
//! - `send`: one consumer, chosen round-robin.
//! - `publish`: every consumer.
//! - `request`: one consumer, with a reply delivered through a [`Future`].
//!
//! Local delivery hands each consumer the body produced by its codec's
//! `transform`; transports move [`WireFrame`]s and re-enter through
//! [`EventBus::deliver_frame`].

pub mod codec;
mod consumer;
mod handlers;
mod message;
mod metrics;
mod producer;
mod registration;
mod reply;
pub mod wire;

pub use codec::{CodecManager, EncodedBody, MessageCodec};
pub use consumer::{BodyStream, MessageConsumer};
pub use message::{DeliveryOptions, Message, MultiMap, DEFAULT_SEND_TIMEOUT};
pub use metrics::{BusStats, EventBusMetrics, NoopMetrics};
pub use producer::{MessageProducer, CREDIT_ADDRESS_HEADER};
pub use reply::{ReplyException, ReplyFailure};
pub use wire::WireFrame;

use codec::ErasedCodec;
use handlers::HandlerTable;
use message::{MessageMeta, RawMessage};
use metrics::StatsCounters;
use registration::{RawHandler, Registration};

use crate::context::{Context, TimerTable};
use crate::future::Future;
use crate::types::{CodecError, Error, EventBusConfig, Result};
use std::any::Any;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Where a delivery's body comes from.
#[derive(Clone, Copy)]
enum BodySource<'a> {
    Local(&'a (dyn Any + Send + Sync)),
    Wire(&'a [u8]),
}

impl BodySource<'_> {
    /// A fresh body for one consumer.
    fn materialize(self, codec: &dyn ErasedCodec) -> std::result::Result<codec::BoxedBody, CodecError> {
        match self {
            BodySource::Local(body) => codec.transform_any(body),
            BodySource::Wire(bytes) => codec.decode_any(bytes),
        }
    }
}

pub(crate) struct BusInner {
    pub(crate) handlers: HandlerTable<Arc<Registration>>,
    codecs: CodecManager,
    pub(crate) timers: Arc<TimerTable>,
    config: EventBusConfig,
    pub(crate) metrics: Arc<dyn EventBusMetrics>,
    stats: StatsCounters,
}

impl BusInner {
    pub(crate) fn on_registered(&self, registration: &Registration) {
        self.stats.active_registrations.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .handler_registered(registration.address(), registration.is_local_only());
        tracing::debug!(
            address = %registration.address(),
            context = %registration.context().id(),
            "Registered handler"
        );
    }

    pub(crate) fn on_unregistered(&self, registration: &Registration) {
        self.stats.active_registrations.fetch_sub(1, Ordering::Relaxed);
        self.metrics.handler_unregistered(registration.address());
        tracing::debug!(address = %registration.address(), "Unregistered handler");
    }

    pub(crate) fn on_discarded(&self, address: &str) {
        StatsCounters::incr(&self.stats.messages_discarded);
        self.metrics.discard_message(address);
    }

    fn on_reply_failure(&self, address: &str, failure: ReplyFailure) {
        StatsCounters::incr(&self.stats.reply_failures);
        self.metrics.reply_failure(address, failure);
    }

    /// Route a message to one consumer (send) or all of them (publish).
    /// Frames from a transport (`local == false`) skip local-only consumers.
    /// Returns the number of consumers reached.
    fn dispatch(
        &self,
        meta: MessageMeta,
        body: BodySource<'_>,
        codec: &dyn ErasedCodec,
        publish: bool,
        local: bool,
    ) -> Result<usize> {
        let reachable = |r: &Arc<Registration>| local || !r.is_local_only();
        let targets: Vec<Arc<Registration>> = match self.handlers.get(&meta.address) {
            None => Vec::new(),
            Some(handlers) if publish => handlers
                .snapshot()
                .iter()
                .filter(|r| reachable(r))
                .cloned()
                .collect(),
            Some(handlers) => (0..handlers.len())
                .filter_map(|_| handlers.choose())
                .find(|r| reachable(r))
                .into_iter()
                .collect(),
        };

        for registration in &targets {
            let raw = RawMessage {
                meta: meta.clone(),
                body: body.materialize(codec)?,
            };
            let registration = Arc::clone(registration);
            registration
                .context()
                .clone()
                .run_on_context(move || registration.receive(raw));
        }

        self.metrics
            .message_received(&meta.address, publish, local, targets.len());
        if targets.is_empty() {
            tracing::trace!(address = %meta.address, publish, "No handlers for address");
        }
        Ok(targets.len())
    }
}

fn validate_address(address: &str) -> Result<()> {
    if address.is_empty() {
        return Err(Error::illegal_argument("address must not be empty"));
    }
    Ok(())
}

/// The message bus. Cheap to clone; clones share one address table.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.inner.handlers)
            .field("codecs", &self.inner.codecs)
            .field("metrics", &self.inner.metrics)
            .finish()
    }
}

impl EventBus {
    pub(crate) fn new(timers: Arc<TimerTable>, config: EventBusConfig, metrics: Arc<dyn EventBusMetrics>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                handlers: HandlerTable::new(),
                codecs: CodecManager::new(),
                timers,
                config,
                metrics,
                stats: StatsCounters::default(),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<BusInner>) -> Self {
        Self { inner }
    }

    fn meta(&self, address: &str, reply_address: Option<String>, options: &DeliveryOptions, send: bool) -> MessageMeta {
        MessageMeta {
            address: address.to_string(),
            reply_address,
            headers: options.headers().clone(),
            send,
            bus: Arc::downgrade(&self.inner),
        }
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Send to one consumer of `address`. Nobody listening is not an error.
    pub fn send<B: Any + Send + Sync>(&self, address: &str, body: B) -> Result<()> {
        self.send_with(address, body, &DeliveryOptions::default())
    }

    pub fn send_with<B: Any + Send + Sync>(&self, address: &str, body: B, options: &DeliveryOptions) -> Result<()> {
        validate_address(address)?;
        let codec = self.inner.codecs.lookup_codec::<B>(options.codec_name())?;
        StatsCounters::incr(&self.inner.stats.messages_sent);
        self.inner.metrics.message_sent(address, false, true);
        let meta = self.meta(address, None, options, true);
        self.inner
            .dispatch(meta, BodySource::Local(&body), codec.as_ref(), false, true)?;
        Ok(())
    }

    /// Send to every consumer of `address`.
    pub fn publish<B: Any + Send + Sync>(&self, address: &str, body: B) -> Result<()> {
        self.publish_with(address, body, &DeliveryOptions::default())
    }

    pub fn publish_with<B: Any + Send + Sync>(&self, address: &str, body: B, options: &DeliveryOptions) -> Result<()> {
        validate_address(address)?;
        let codec = self.inner.codecs.lookup_codec::<B>(options.codec_name())?;
        StatsCounters::incr(&self.inner.stats.messages_published);
        self.inner.metrics.message_sent(address, true, true);
        let meta = self.meta(address, None, options, false);
        self.inner
            .dispatch(meta, BodySource::Local(&body), codec.as_ref(), true, true)?;
        Ok(())
    }

    /// Send to one consumer and expect a reply of type `R`.
    ///
    /// The returned future completes on `context` with the reply, or fails
    /// with a [`ReplyException`]: `NO_HANDLERS` when nobody listens,
    /// `TIMEOUT` when no reply arrives in time, `RECIPIENT_FAILURE` when the
    /// consumer calls [`Message::fail`].
    pub fn request<B, R>(
        &self,
        context: &Context,
        address: &str,
        body: B,
        options: &DeliveryOptions,
    ) -> Result<Future<Message<R>>>
    where
        B: Any + Send + Sync,
        R: Any + Send + Sync,
    {
        validate_address(address)?;
        let codec = self.inner.codecs.lookup_codec::<B>(options.codec_name())?;
        let reply_address = uuid::Uuid::new_v4().to_string();
        let future: Future<Message<R>> = Future::on_context(context.clone());

        let registration = Registration::new(
            reply_address.clone(),
            context.clone(),
            Arc::downgrade(&self.inner),
            options.is_local_only(),
            self.inner.config.max_buffered_messages,
        );
        registration.set_handler(Some(self.reply_handler(&registration, address, future.clone())))?;

        let timeout = options
            .send_timeout()
            .unwrap_or(self.inner.config.default_send_timeout);
        let timer = {
            let registration = Arc::clone(&registration);
            let future = future.clone();
            let bus = Arc::downgrade(&self.inner);
            let target = address.to_string();
            self.inner.timers.set_timer(context, timeout, move |_| {
                if !registration.unregister(None) {
                    return;
                }
                if let Some(bus) = bus.upgrade() {
                    bus.on_reply_failure(&target, ReplyFailure::Timeout);
                }
                future.try_fail(Error::Reply(ReplyException::timeout(format!(
                    "Timed out after waiting {}ms for a reply. address: {}, reply address: {}",
                    timeout.as_millis(),
                    target,
                    registration.address()
                ))));
            })
        };
        let timer = match timer {
            Ok(timer) => timer,
            Err(e) => {
                registration.unregister(None);
                return Err(e);
            }
        };
        if !registration.set_timeout_timer(timer) {
            self.inner.timers.cancel_timer(timer);
        }

        StatsCounters::incr(&self.inner.stats.requests_sent);
        self.inner.metrics.message_sent(address, false, true);
        let meta = self.meta(address, Some(reply_address), options, true);
        let delivered = match self
            .inner
            .dispatch(meta, BodySource::Local(&body), codec.as_ref(), false, true)
        {
            Ok(delivered) => delivered,
            Err(e) => {
                registration.unregister(None);
                return Err(e);
            }
        };

        if delivered == 0 && registration.unregister(None) {
            self.inner.on_reply_failure(address, ReplyFailure::NoHandlers);
            future.try_fail(Error::Reply(ReplyException::no_handlers(address)));
        }
        Ok(future)
    }

    /// The first reply wins; later replies and the timeout are ignored.
    fn reply_handler<R: Any + Send + Sync>(
        &self,
        registration: &Arc<Registration>,
        address: &str,
        future: Future<Message<R>>,
    ) -> RawHandler {
        let registration = Arc::downgrade(registration);
        let bus = Arc::downgrade(&self.inner);
        let target = address.to_string();
        Arc::new(move |raw: RawMessage| {
            match registration.upgrade() {
                Some(registration) if registration.unregister(None) => {}
                _ => return,
            }
            let RawMessage { meta, body } = raw;
            match body.downcast::<ReplyException>() {
                Ok(exception) => {
                    if let Some(bus) = bus.upgrade() {
                        bus.on_reply_failure(&target, exception.failure_type());
                    }
                    future.try_fail(Error::Reply(*exception));
                }
                Err(body) => match (RawMessage { meta, body }).into_typed::<R>() {
                    Ok(message) => {
                        future.try_complete(message);
                    }
                    Err(_) => {
                        future.try_fail(
                            CodecError::TypeMismatch {
                                codec: "reply".to_string(),
                                type_name: std::any::type_name::<R>().to_string(),
                            }
                            .into(),
                        );
                    }
                },
            }
        })
    }

    // =========================================================================
    // Consumers and producers
    // =========================================================================

    /// A consumer of `address` delivering on `context`. It registers once a
    /// handler is attached.
    pub fn consumer<T: Any + Send + Sync>(&self, context: &Context, address: &str) -> Result<MessageConsumer<T>> {
        self.new_consumer(context, address, false)
    }

    /// Like [`consumer`](EventBus::consumer), never reachable from a transport.
    pub fn local_consumer<T: Any + Send + Sync>(&self, context: &Context, address: &str) -> Result<MessageConsumer<T>> {
        self.new_consumer(context, address, true)
    }

    fn new_consumer<T: Any + Send + Sync>(&self, context: &Context, address: &str, local_only: bool) -> Result<MessageConsumer<T>> {
        validate_address(address)?;
        let registration = Registration::new(
            address.to_string(),
            context.clone(),
            Arc::downgrade(&self.inner),
            local_only,
            self.inner.config.max_buffered_messages,
        );
        Ok(MessageConsumer::new(registration))
    }

    /// A credit-limited [`WriteStream`](crate::streams::WriteStream) sending
    /// to `address`. Credit returns are handled on `context`.
    pub fn sender<T: Any + Send + Sync>(&self, context: &Context, address: &str) -> Result<MessageProducer<T>> {
        self.sender_with(context, address, DeliveryOptions::default())
    }

    pub fn sender_with<T: Any + Send + Sync>(
        &self,
        context: &Context,
        address: &str,
        options: DeliveryOptions,
    ) -> Result<MessageProducer<T>> {
        validate_address(address)?;
        MessageProducer::new(
            self.clone(),
            context,
            address,
            options,
            self.inner.config.producer_max_credits,
        )
    }

    /// Live consumers of `address`.
    pub fn handler_count(&self, address: &str) -> usize {
        self.inner.handlers.count(address)
    }

    // =========================================================================
    // Codecs
    // =========================================================================

    pub fn codec_manager(&self) -> &CodecManager {
        &self.inner.codecs
    }

    pub fn register_codec<C: MessageCodec>(&self, codec: C) -> Result<()> {
        Ok(self.inner.codecs.register_codec(codec)?)
    }

    pub fn unregister_codec(&self, name: &str) -> bool {
        self.inner.codecs.unregister_codec(name)
    }

    pub fn register_default_codec<C: MessageCodec>(&self, codec: C) -> Result<()> {
        Ok(self.inner.codecs.register_default_codec(codec)?)
    }

    pub fn unregister_default_codec<T: Any>(&self) -> bool {
        self.inner.codecs.unregister_default_codec::<T>()
    }

    // =========================================================================
    // Transport entry points
    // =========================================================================

    /// Encode a point-to-point message for a transport.
    pub fn encode_frame<B: Any + Send + Sync>(&self, address: &str, body: &B, options: &DeliveryOptions) -> Result<WireFrame> {
        validate_address(address)?;
        let encoded = self.inner.codecs.encode_body(body, options.codec_name())?;
        Ok(WireFrame {
            address: address.to_string(),
            reply_address: None,
            headers: options.headers().clone(),
            send: true,
            codec_id: encoded.codec_id,
            codec_name: encoded.codec_name,
            body: encoded.bytes,
        })
    }

    /// Deliver a frame received from a transport. Local-only consumers are
    /// skipped. Returns the number of consumers reached.
    pub fn deliver_frame(&self, frame: WireFrame) -> Result<usize> {
        validate_address(&frame.address)?;
        let codec = self
            .inner
            .codecs
            .wire_codec(frame.codec_id, frame.codec_name.as_deref())?;
        let meta = MessageMeta {
            address: frame.address,
            reply_address: frame.reply_address,
            headers: frame.headers,
            send: frame.send,
            bus: Arc::downgrade(&self.inner),
        };
        let publish = !meta.send;
        self.inner
            .dispatch(meta, BodySource::Wire(&frame.body), codec.as_ref(), publish, false)
    }

    // =========================================================================
    // Stats
    // =========================================================================

    pub fn stats(&self) -> BusStats {
        self.inner.stats.snapshot()
    }

    /// Reset message counters. Active registrations are kept.
    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }
}
