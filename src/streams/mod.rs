//! Flow-controlled stream contract.
//!
//! A [`ReadStream`] pushes items to a single handler and can be paused; a
//! [`WriteStream`] accepts items without blocking and reports when its queue
//! is full, calling a drain handler once it has room again. [`Pump`] wires
//! the two together so a fast producer never overruns a slow consumer.

mod pump;

pub use pump::Pump;

use crate::types::Result;
use std::sync::Arc;

/// Item callback shared between a stream and the code feeding it.
pub type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

/// One-shot callback (end of stream, drain).
pub type Signal = Box<dyn FnOnce() + Send>;

/// A source of items with pause/resume flow control.
pub trait ReadStream<T>: Send + Sync {
    /// Set the item handler, replacing the previous one. `None` detaches.
    fn handler(&self, handler: Option<Handler<T>>) -> Result<()>;

    /// Stop delivering items until [`resume`](ReadStream::resume).
    fn pause(&self);

    fn resume(&self);

    /// Set the handler called once when the stream ends.
    fn end_handler(&self, handler: Option<Signal>);
}

/// A sink of items with a bounded write queue.
pub trait WriteStream<T>: Send + Sync {
    /// Queue an item. Never blocks; callers check
    /// [`write_queue_full`](WriteStream::write_queue_full) to apply backpressure.
    fn write(&self, item: T) -> Result<()>;

    fn set_write_queue_max_size(&self, max_size: usize);

    fn write_queue_full(&self) -> bool;

    /// Set the handler called once the queue falls to half its maximum.
    /// It fires at most once per full episode.
    fn drain_handler(&self, handler: Option<Signal>);

    /// Signal that no more items will be written.
    fn end(&self) {}
}
