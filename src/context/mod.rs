//! Execution contexts.
//!
//! A [`Context`] is the unit of thread affinity. Every callback the runtime
//! delivers (messages, timer events, future completions) is scheduled onto a
//! context and runs there in FIFO order:
//!
//! - **EventLoop**: a single bound event-loop thread.
//! - **Worker**: the worker pool, one task at a time in submission order.
//! - **MultiThreadedWorker**: the worker pool, no ordering.
//!
//! Blocking work goes through [`Context::execute_blocking`], which never runs
//! on an event-loop thread and hands its result back through the context.

mod blocked_checker;
mod event_loop;
mod timers;
mod worker_pool;

pub use blocked_checker::BlockedThreadChecker;
pub use timers::{TimeoutStream, TimerTable};

pub(crate) use event_loop::EventLoop;
pub(crate) use worker_pool::{TaskQueue, WorkerPool};

use crate::future::Future;
use crate::types::{panic_message, ContextId, DeploymentId, Error, HookId, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// A unit of work queued onto a thread.
pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

type CloseHook = Box<dyn FnOnce() + Send>;
type ExceptionHandler = Arc<dyn Fn(&Error) + Send + Sync>;

thread_local! {
    static CURRENT_CONTEXT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// Where a context's tasks execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    EventLoop,
    Worker,
    MultiThreadedWorker,
}

impl ContextKind {
    pub fn is_worker(&self) -> bool {
        !matches!(self, ContextKind::EventLoop)
    }
}

#[derive(Default)]
struct CloseHooks {
    next_id: u64,
    hooks: Vec<(HookId, CloseHook)>,
}

struct ContextInner {
    id: ContextId,
    kind: ContextKind,
    deployment: Option<DeploymentId>,
    event_loop: Arc<EventLoop>,
    workers: Arc<WorkerPool>,
    ordered_tasks: Arc<TaskQueue>,
    ordered_blocking: Arc<TaskQueue>,
    close_hooks: Mutex<CloseHooks>,
    exception_handler: Mutex<Option<ExceptionHandler>>,
    closed: AtomicBool,
}

/// Handle to an execution context. Cheap to clone.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("event_loop", &self.inner.event_loop.name())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Context {}

/// Non-owning handle to a [`Context`].
#[derive(Clone)]
pub(crate) struct WeakContext {
    inner: Weak<ContextInner>,
}

impl WeakContext {
    pub(crate) fn upgrade(&self) -> Option<Context> {
        self.inner.upgrade().map(|inner| Context { inner })
    }
}

impl Context {
    pub(crate) fn new(
        kind: ContextKind,
        deployment: Option<DeploymentId>,
        event_loop: Arc<EventLoop>,
        workers: Arc<WorkerPool>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: ContextId::new(),
                kind,
                deployment,
                event_loop,
                workers,
                ordered_tasks: Arc::new(TaskQueue::default()),
                ordered_blocking: Arc::new(TaskQueue::default()),
                close_hooks: Mutex::new(CloseHooks::default()),
                exception_handler: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The context whose task is running on this thread, if any.
    pub fn current() -> Option<Context> {
        CURRENT_CONTEXT.with(|c| c.borrow().clone())
    }

    /// Whether the caller runs on an event-loop thread.
    pub fn is_on_event_loop_thread() -> bool {
        event_loop::current_loop_id().is_some()
    }

    /// Whether the caller runs on a worker-pool thread.
    pub fn is_on_worker_thread() -> bool {
        worker_pool::is_worker_thread()
    }

    pub fn id(&self) -> &ContextId {
        &self.inner.id
    }

    pub fn kind(&self) -> ContextKind {
        self.inner.kind
    }

    pub fn deployment(&self) -> Option<&DeploymentId> {
        self.inner.deployment.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(crate) fn downgrade(&self) -> WeakContext {
        WeakContext {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn event_loop(&self) -> &Arc<EventLoop> {
        &self.inner.event_loop
    }

    /// Schedule `task` on this context. Never runs synchronously.
    pub fn run_on_context<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let context = self.clone();
        let wrapped: Task = Box::new(move || context.run_task(task));
        match self.inner.kind {
            ContextKind::EventLoop => self.inner.event_loop.execute(wrapped),
            ContextKind::Worker => self
                .inner
                .ordered_tasks
                .execute(wrapped, &self.inner.workers),
            ContextKind::MultiThreadedWorker => self.inner.workers.execute(wrapped),
        }
    }

    fn run_task<F: FnOnce()>(&self, task: F) {
        self.assert_affinity();
        let previous = CURRENT_CONTEXT.with(|c| c.replace(Some(self.clone())));
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(task));
        CURRENT_CONTEXT.with(|c| *c.borrow_mut() = previous);
        if let Err(payload) = outcome {
            self.report_failure(Error::uncaught(panic_message(payload.as_ref())));
        }
    }

    fn assert_affinity(&self) {
        match self.inner.kind {
            ContextKind::EventLoop => debug_assert_eq!(
                event_loop::current_loop_id(),
                Some(self.inner.event_loop.id()),
                "event loop context task running on a foreign thread"
            ),
            ContextKind::Worker | ContextKind::MultiThreadedWorker => debug_assert!(
                worker_pool::is_worker_thread(),
                "worker context task running outside the worker pool"
            ),
        }
    }

    /// Install the handler for failures escaping this context's tasks.
    pub fn exception_handler<F>(&self, handler: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        *self.inner.exception_handler.lock() = Some(Arc::new(handler));
    }

    pub fn clear_exception_handler(&self) {
        self.inner.exception_handler.lock().take();
    }

    pub(crate) fn report_failure(&self, error: Error) {
        let handler = self.inner.exception_handler.lock().clone();
        match handler {
            Some(handler) => handler(&error),
            None => tracing::error!(context = %self.inner.id, "Unhandled exception: {}", error),
        }
    }

    /// Run `action` on a worker thread and complete the returned future on
    /// this context. Ordered actions from one context run one at a time in
    /// submission order; unordered ones run concurrently.
    pub fn execute_blocking<T, F>(&self, action: F, ordered: bool) -> Future<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let future = Future::on_context(self.clone());
        let completer = future.clone();
        let job: Task = Box::new(move || {
            let outcome = match std::panic::catch_unwind(AssertUnwindSafe(action)) {
                Ok(outcome) => outcome,
                Err(payload) => Err(Error::uncaught(panic_message(payload.as_ref()))),
            };
            completer.handle(outcome);
        });

        if ordered {
            self.inner
                .ordered_blocking
                .execute(job, &self.inner.workers);
        } else {
            self.inner.workers.execute(job);
        }
        future
    }

    /// Register a hook run when the context closes.
    pub fn add_close_hook<F>(&self, hook: F) -> Result<HookId>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut hooks = self.inner.close_hooks.lock();
        if self.is_closed() {
            return Err(Error::illegal_state(format!(
                "context {} is closed",
                self.inner.id
            )));
        }
        hooks.next_id += 1;
        let id = HookId::from_raw(hooks.next_id);
        hooks.hooks.push((id, Box::new(hook)));
        Ok(id)
    }

    /// Remove a close hook. Returns false if it already ran or was removed.
    pub fn remove_close_hook(&self, id: HookId) -> bool {
        let mut hooks = self.inner.close_hooks.lock();
        let before = hooks.hooks.len();
        hooks.hooks.retain(|(hook_id, _)| *hook_id != id);
        hooks.hooks.len() != before
    }

    /// Close the context: run its close hooks in registration order.
    /// Subsequent timers and registrations on it fail with `IllegalState`.
    pub fn close(&self) {
        let hooks = {
            let mut hooks = self.inner.close_hooks.lock();
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut hooks.hooks)
        };

        tracing::debug!(context = %self.inner.id, "Closing context, running {} close hooks", hooks.len());

        for (_, hook) in hooks {
            if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(hook)) {
                tracing::error!(
                    context = %self.inner.id,
                    "Close hook failed: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn close_hook_count(&self) -> usize {
        self.inner.close_hooks.lock().hooks.len()
    }
}
