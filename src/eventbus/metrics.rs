//! Event bus metrics hooks and usage counters.
//!
//! [`EventBusMetrics`] is the seam for an external metrics collector; every
//! hook defaults to a no-op. [`BusStats`] is the built-in snapshot returned by
//! [`EventBus::stats`](super::EventBus::stats).

use super::ReplyFailure;
use crate::types::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Callbacks invoked by the bus as messages flow.
pub trait EventBusMetrics: Send + Sync + fmt::Debug {
    fn handler_registered(&self, _address: &str, _local_only: bool) {}

    fn handler_unregistered(&self, _address: &str) {}

    fn begin_handle_message(&self, _address: &str, _local: bool) {}

    fn end_handle_message(&self, _address: &str, _failure: Option<&Error>) {}

    /// A message left a sender. `publish` is false for point-to-point sends.
    fn message_sent(&self, _address: &str, _publish: bool, _local: bool) {}

    /// A message was routed. `handlers` is the number of consumers reached
    /// (zero when nobody listens on the address).
    fn message_received(&self, _address: &str, _publish: bool, _local: bool, _handlers: usize) {}

    fn reply_failure(&self, _address: &str, _failure: ReplyFailure) {}

    fn discard_message(&self, _address: &str) {}
}

/// Metrics implementation that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl EventBusMetrics for NoopMetrics {}

/// Statistics about bus usage.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub messages_sent: u64,
    pub messages_published: u64,
    pub requests_sent: u64,
    pub reply_failures: u64,
    pub messages_discarded: u64,
    pub active_registrations: usize,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) messages_sent: AtomicU64,
    pub(crate) messages_published: AtomicU64,
    pub(crate) requests_sent: AtomicU64,
    pub(crate) reply_failures: AtomicU64,
    pub(crate) messages_discarded: AtomicU64,
    pub(crate) active_registrations: AtomicUsize,
}

impl StatsCounters {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> BusStats {
        BusStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            reply_failures: self.reply_failures.load(Ordering::Relaxed),
            messages_discarded: self.messages_discarded.load(Ordering::Relaxed),
            active_registrations: self.active_registrations.load(Ordering::Relaxed),
        }
    }

    /// Reset the message counters. Registration gauges are left alone.
    pub(crate) fn reset(&self) {
        self.messages_sent.store(0, Ordering::Relaxed);
        self.messages_published.store(0, Ordering::Relaxed);
        self.requests_sent.store(0, Ordering::Relaxed);
        self.reply_failures.store(0, Ordering::Relaxed);
        self.messages_discarded.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_keeps_registrations() {
        let counters = StatsCounters::default();
        StatsCounters::incr(&counters.messages_sent);
        StatsCounters::incr(&counters.reply_failures);
        counters.active_registrations.fetch_add(2, Ordering::Relaxed);

        let stats = counters.snapshot();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.reply_failures, 1);

        counters.reset();
        let stats = counters.snapshot();
        assert_eq!(stats.messages_sent, 0);
        assert_eq!(stats.reply_failures, 0);
        assert_eq!(stats.active_registrations, 2);
    }
}
