//! Pump: moves items from a read stream into a write stream.

use super::{Handler, ReadStream, WriteStream};
use crate::types::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Reads from a source and writes to a sink, pausing the source whenever the
/// sink's write queue is full and resuming it on drain.
pub struct Pump<T: 'static> {
    source: Arc<dyn ReadStream<T>>,
    sink: Arc<dyn WriteStream<T>>,
    write_queue_max_size: Option<usize>,
    pumped: Arc<AtomicU64>,
    started: AtomicBool,
}

impl<T: 'static> fmt::Debug for Pump<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pump")
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("pumped", &self.pumped.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Send + 'static> Pump<T> {
    pub fn new(source: Arc<dyn ReadStream<T>>, sink: Arc<dyn WriteStream<T>>) -> Self {
        Self {
            source,
            sink,
            write_queue_max_size: None,
            pumped: Arc::new(AtomicU64::new(0)),
            started: AtomicBool::new(false),
        }
    }

    /// Apply this write queue size to the sink on start.
    pub fn with_write_queue_max_size(mut self, max_size: usize) -> Self {
        self.write_queue_max_size = Some(max_size);
        self
    }

    /// Start pumping. Fails with `IllegalState` when already started.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::illegal_state("pump is already started"));
        }
        if let Some(max_size) = self.write_queue_max_size {
            self.sink.set_write_queue_max_size(max_size);
        }

        let sink = Arc::clone(&self.sink);
        let source: Weak<dyn ReadStream<T>> = Arc::downgrade(&self.source);
        let pumped = Arc::clone(&self.pumped);

        let handler: Handler<T> = Arc::new(move |item: T| {
            if let Err(e) = sink.write(item) {
                tracing::warn!("pump write failed: {}", e);
                return;
            }
            pumped.fetch_add(1, Ordering::Relaxed);
            if sink.write_queue_full() {
                if let Some(paused) = source.upgrade() {
                    paused.pause();
                    let resume = Weak::clone(&source);
                    sink.drain_handler(Some(Box::new(move || {
                        if let Some(source) = resume.upgrade() {
                            source.resume();
                        }
                    })));
                }
            }
        });

        if let Err(e) = self.source.handler(Some(handler)) {
            self.started.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    /// Stop pumping. The pump may be started again.
    pub fn stop(&self) -> Result<()> {
        self.sink.drain_handler(None);
        self.source.handler(None)?;
        self.started.store(false, Ordering::Release);
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Number of items written to the sink so far.
    pub fn number_pumped(&self) -> u64 {
        self.pumped.load(Ordering::Relaxed)
    }
}
