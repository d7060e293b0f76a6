//! Blocking worker pool and per-context ordered task queues.

use super::blocked_checker::{ActivitySlot, BlockedThreadChecker};
use super::Task;
use crate::types::Result;
use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};

const WORKER_THREAD_NAME: &str = "courier-worker-thread";

thread_local! {
    static IS_WORKER: Cell<bool> = const { Cell::new(false) };
    static WORKER_SLOT: RefCell<Option<Arc<ActivitySlot>>> = const { RefCell::new(None) };
}

/// Whether the current thread belongs to a worker pool.
pub(crate) fn is_worker_thread() -> bool {
    IS_WORKER.with(Cell::get)
}

/// Blocking tasks run on the blocking pool of a dedicated tokio runtime.
pub(crate) struct WorkerPool {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    size: usize,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool").field("size", &self.size).finish()
    }
}

impl WorkerPool {
    pub(crate) fn start(
        size: usize,
        checker: &Arc<BlockedThreadChecker>,
        max_execute_time: Duration,
    ) -> Result<Arc<Self>> {
        let on_start = Arc::clone(checker);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(size.max(1))
            .thread_name(WORKER_THREAD_NAME)
            .on_thread_start(move || {
                IS_WORKER.with(|w| w.set(true));
                let slot = on_start.register(WORKER_THREAD_NAME, max_execute_time);
                WORKER_SLOT.with(|s| *s.borrow_mut() = Some(slot));
            })
            .on_thread_stop(|| {
                WORKER_SLOT.with(|s| s.borrow_mut().take());
            })
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        tracing::debug!("Started worker pool with {} threads", size);

        Ok(Arc::new(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
            size,
        }))
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run a task on a blocking thread.
    pub(crate) fn execute(&self, task: Task) {
        // Dropped without running when the runtime has been shut down.
        let _ = self.handle.spawn_blocking(move || {
            let slot = WORKER_SLOT.with(|s| s.borrow().clone());
            if let Some(slot) = &slot {
                slot.begin();
            }
            task();
            if let Some(slot) = &slot {
                slot.end();
            }
        });
    }

    pub(crate) fn shutdown(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<Task>,
    running: bool,
}

/// Serializes tasks onto the worker pool: one at a time, in FIFO order.
#[derive(Default)]
pub(crate) struct TaskQueue {
    state: Mutex<QueueState>,
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TaskQueue")
            .field("queued", &state.tasks.len())
            .field("running", &state.running)
            .finish()
    }
}

impl TaskQueue {
    pub(crate) fn execute(self: &Arc<Self>, task: Task, pool: &WorkerPool) {
        let mut state = self.state.lock();
        state.tasks.push_back(task);
        if !state.running {
            state.running = true;
            drop(state);
            let queue = Arc::clone(self);
            pool.execute(Box::new(move || queue.run()));
        }
    }

    fn run(&self) {
        loop {
            let task = {
                let mut state = self.state.lock();
                match state.tasks.pop_front() {
                    Some(task) => task,
                    None => {
                        state.running = false;
                        return;
                    }
                }
            };
            task();
        }
    }
}
