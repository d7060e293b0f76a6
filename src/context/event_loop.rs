//! Event-loop threads.
//!
//! Each loop is a dedicated OS thread driving a current-thread tokio runtime.
//! Tasks arrive over an unbounded channel and run strictly in submission
//! order; timers are spawned onto the same runtime so they wake on the loop
//! that owns them.

use super::blocked_checker::{ActivitySlot, BlockedThreadChecker};
use super::Task;
use crate::types::{Error, Result};
use parking_lot::Mutex;
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

static NEXT_LOOP_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static CURRENT_LOOP: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Identity of the event loop driving the current thread, if any.
pub(crate) fn current_loop_id() -> Option<usize> {
    CURRENT_LOOP.with(Cell::get)
}

/// A single event-loop thread.
pub(crate) struct EventLoop {
    id: usize,
    name: String,
    tx: mpsc::UnboundedSender<Task>,
    handle: Handle,
    shutdown: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl EventLoop {
    /// Start an event loop thread named `courier-eventloop-thread-{index}`.
    pub(crate) fn start(
        index: usize,
        checker: &Arc<BlockedThreadChecker>,
        max_execute_time: Duration,
    ) -> Result<Arc<Self>> {
        let id = NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed);
        let name = format!("courier-eventloop-thread-{}", index);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let slot = checker.register(&name, max_execute_time);

        let token = shutdown.clone();
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                CURRENT_LOOP.with(|current| current.set(Some(id)));
                runtime.block_on(run_loop(rx, token, slot));
            })
            .map_err(|e| Error::internal(format!("failed to spawn event loop: {}", e)))?;

        tracing::debug!("Started event loop {} (id={})", name, id);

        Ok(Arc::new(Self {
            id,
            name,
            tx,
            handle,
            shutdown,
            thread: Mutex::new(Some(thread)),
        }))
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Queue a task. Tasks submitted after shutdown are dropped.
    pub(crate) fn execute(&self, task: Task) {
        if self.tx.send(task).is_err() {
            tracing::debug!("Event loop {} is stopped, dropping task", self.name);
        }
    }

    /// Stop the loop and wait for its thread, unless called from that thread.
    pub(crate) fn shutdown(&self) {
        self.shutdown.cancel();
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if current_loop_id() == Some(self.id) {
                return;
            }
            if thread.join().is_err() {
                tracing::error!("Event loop {} terminated with a panic", self.name);
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_loop(
    mut rx: mpsc::UnboundedReceiver<Task>,
    shutdown: CancellationToken,
    slot: Arc<ActivitySlot>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            task = rx.recv() => match task {
                Some(task) => {
                    slot.begin();
                    task();
                    slot.end();
                }
                None => break,
            },
        }
    }
    tracing::debug!("Event loop stopped");
}
