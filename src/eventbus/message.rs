//! Messages, headers, and delivery options.

use super::codec::BoxedBody;
use super::{BusInner, EventBus, ReplyException};
use crate::context::Context;
use crate::future::Future;
use crate::types::{Error, Result};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Weak;
use std::time::Duration;

/// Reply timeout used when neither the options nor the bus config set one.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Headers
// =============================================================================

/// Ordered multi-valued map with case-insensitive names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiMap {
    entries: Vec<(String, String)>,
}

impl MultiMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value, keeping existing values for the name.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.push((name.into(), value.into()));
        self
    }

    /// Replace all values for the name with a single value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
        self
    }

    /// First value for the name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Remove every value for the name. Returns whether anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for MultiMap {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(n, v)| (n.into(), v.into())).collect(),
        }
    }
}

// =============================================================================
// Delivery options
// =============================================================================

/// Per-send options: reply timeout, explicit codec, headers.
#[derive(Debug, Clone, Default)]
pub struct DeliveryOptions {
    send_timeout: Option<Duration>,
    codec_name: Option<String>,
    headers: MultiMap,
    local_only: bool,
}

impl DeliveryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply timeout for requests. Must be at least 1 ms.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Result<Self> {
        if timeout < Duration::from_millis(1) {
            return Err(Error::illegal_argument(format!(
                "send timeout must be >= 1 ms (got {:?})",
                timeout
            )));
        }
        self.send_timeout = Some(timeout);
        Ok(self)
    }

    /// Encode the body with the named user codec.
    pub fn with_codec_name(mut self, name: impl Into<String>) -> Self {
        self.codec_name = Some(name.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn with_headers(mut self, headers: MultiMap) -> Self {
        self.headers = headers;
        self
    }

    /// Keep the message inside this process even when a transport is attached.
    pub fn with_local_only(mut self, local_only: bool) -> Self {
        self.local_only = local_only;
        self
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout
    }

    pub fn codec_name(&self) -> Option<&str> {
        self.codec_name.as_deref()
    }

    pub fn headers(&self) -> &MultiMap {
        &self.headers
    }

    pub fn is_local_only(&self) -> bool {
        self.local_only
    }

    pub(crate) fn headers_mut(&mut self) -> &mut MultiMap {
        &mut self.headers
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Envelope fields shared by typed and untyped messages.
#[derive(Clone)]
pub(crate) struct MessageMeta {
    pub(crate) address: String,
    pub(crate) reply_address: Option<String>,
    pub(crate) headers: MultiMap,
    pub(crate) send: bool,
    pub(crate) bus: Weak<BusInner>,
}

impl fmt::Debug for MessageMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageMeta")
            .field("address", &self.address)
            .field("reply_address", &self.reply_address)
            .field("headers", &self.headers)
            .field("send", &self.send)
            .finish()
    }
}

impl MessageMeta {
    fn bus(&self) -> Result<EventBus> {
        self.bus
            .upgrade()
            .map(EventBus::from_inner)
            .ok_or_else(|| Error::illegal_state("event bus is closed"))
    }

    pub(crate) fn reply<R: Any + Send + Sync>(&self, body: R, options: &DeliveryOptions) -> Result<()> {
        match &self.reply_address {
            Some(address) => self.bus()?.send_with(address, body, options),
            None => Ok(()),
        }
    }

    pub(crate) fn fail(&self, code: i32, message: impl Into<String>) -> Result<()> {
        self.reply(
            ReplyException::recipient_failure(code, message),
            &DeliveryOptions::default(),
        )
    }
}

/// A delivered message with a typed body.
pub struct Message<T> {
    meta: MessageMeta,
    body: T,
}

impl<T: Clone> Clone for Message<T> {
    fn clone(&self) -> Self {
        Self {
            meta: self.meta.clone(),
            body: self.body.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Message<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("address", &self.meta.address)
            .field("reply_address", &self.meta.reply_address)
            .field("send", &self.meta.send)
            .field("body", &self.body)
            .finish()
    }
}

impl<T> Message<T> {
    pub fn address(&self) -> &str {
        &self.meta.address
    }

    pub fn reply_address(&self) -> Option<&str> {
        self.meta.reply_address.as_deref()
    }

    pub fn headers(&self) -> &MultiMap {
        &self.meta.headers
    }

    /// True for point-to-point sends, false for publishes.
    pub fn is_send(&self) -> bool {
        self.meta.send
    }

    pub fn body(&self) -> &T {
        &self.body
    }

    pub fn into_body(self) -> T {
        self.body
    }

    /// Answer the sender. A no-op when the sender expects no reply.
    pub fn reply<R: Any + Send + Sync>(&self, body: R) -> Result<()> {
        self.meta.reply(body, &DeliveryOptions::default())
    }

    pub fn reply_with<R: Any + Send + Sync>(&self, body: R, options: &DeliveryOptions) -> Result<()> {
        self.meta.reply(body, options)
    }

    /// Reply and expect a further reply, handled on `context`.
    pub fn reply_and_request<R, S>(
        &self,
        context: &Context,
        body: R,
        options: &DeliveryOptions,
    ) -> Result<Future<Message<S>>>
    where
        R: Any + Send + Sync,
        S: Any + Send + Sync,
    {
        let address = self
            .meta
            .reply_address
            .as_deref()
            .ok_or_else(|| Error::illegal_state("message does not expect a reply"))?;
        self.meta.bus()?.request(context, address, body, options)
    }

    /// Fail the request: the requester sees `RECIPIENT_FAILURE` with this
    /// code and message.
    pub fn fail(&self, code: i32, message: impl Into<String>) -> Result<()> {
        self.meta.fail(code, message)
    }
}

/// A message whose body has not been downcast yet.
pub(crate) struct RawMessage {
    pub(crate) meta: MessageMeta,
    pub(crate) body: BoxedBody,
}

impl fmt::Debug for RawMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMessage").field("meta", &self.meta).finish()
    }
}

impl RawMessage {
    pub(crate) fn headers(&self) -> &MultiMap {
        &self.meta.headers
    }

    pub(crate) fn into_typed<T: Any>(self) -> std::result::Result<Message<T>, RawMessage> {
        match self.body.downcast::<T>() {
            Ok(body) => Ok(Message {
                meta: self.meta,
                body: *body,
            }),
            Err(body) => Err(RawMessage {
                meta: self.meta,
                body,
            }),
        }
    }
}
