//! Courier - the top-level runtime.
//!
//! Owns the event-loop threads, the worker pool, the timer table, the
//! blocked-thread checker and one [`EventBus`]. Contexts are created here and
//! assigned to event loops round-robin.

use crate::context::{
    BlockedThreadChecker, Context, ContextKind, EventLoop, TimeoutStream, TimerTable, WeakContext, WorkerPool,
};
use crate::eventbus::{EventBus, EventBusMetrics, NoopMetrics};
use crate::types::{Config, DeploymentId, Error, Result, TimerId};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct CourierInner {
    config: Config,
    checker: Arc<BlockedThreadChecker>,
    event_loops: Vec<Arc<EventLoop>>,
    next_loop: AtomicUsize,
    workers: Arc<WorkerPool>,
    timers: Arc<TimerTable>,
    event_bus: EventBus,
    contexts: Mutex<Vec<WeakContext>>,
    closed: AtomicBool,
}

impl CourierInner {
    fn shutdown_threads(&self) {
        self.checker.stop();
        for event_loop in &self.event_loops {
            event_loop.shutdown();
        }
        self.workers.shutdown();
    }
}

impl Drop for CourierInner {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown_threads();
        }
    }
}

/// Runtime handle. Cheap to clone.
#[derive(Clone)]
pub struct Courier {
    inner: Arc<CourierInner>,
}

impl fmt::Debug for Courier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Courier")
            .field("event_loops", &self.inner.event_loops.len())
            .field("workers", &self.inner.workers)
            .field("timers", &self.inner.timers)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Courier {
    /// Start a runtime with metrics disabled.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_metrics(config, Arc::new(NoopMetrics))
    }

    /// Start a runtime reporting bus activity to `metrics`.
    pub fn with_metrics(config: Config, metrics: Arc<dyn EventBusMetrics>) -> Result<Self> {
        let runtime = &config.runtime;
        if runtime.event_loop_pool_size == 0 {
            return Err(Error::illegal_argument("event_loop_pool_size must be > 0"));
        }
        if runtime.worker_pool_size == 0 {
            return Err(Error::illegal_argument("worker_pool_size must be > 0"));
        }

        let checker = BlockedThreadChecker::new();
        let event_loops = (0..runtime.event_loop_pool_size)
            .map(|index| EventLoop::start(index, &checker, runtime.max_event_loop_execute_time))
            .collect::<Result<Vec<_>>>()?;
        let workers = WorkerPool::start(
            runtime.worker_pool_size,
            &checker,
            runtime.max_worker_execute_time,
        )?;
        checker.start(workers.handle(), runtime.blocked_thread_check_interval);

        let timers = TimerTable::new();
        let event_bus = EventBus::new(Arc::clone(&timers), config.event_bus.clone(), metrics);

        tracing::info!(
            event_loops = event_loops.len(),
            workers = runtime.worker_pool_size,
            "Courier started"
        );

        Ok(Self {
            inner: Arc::new(CourierInner {
                config,
                checker,
                event_loops,
                next_loop: AtomicUsize::new(0),
                workers,
                timers,
                event_bus,
                contexts: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.event_bus
    }

    pub fn timer_table(&self) -> &Arc<TimerTable> {
        &self.inner.timers
    }

    pub fn blocked_thread_checker(&self) -> &Arc<BlockedThreadChecker> {
        &self.inner.checker
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    // =========================================================================
    // Contexts
    // =========================================================================

    pub fn create_event_loop_context(&self) -> Result<Context> {
        self.create_context(ContextKind::EventLoop, None)
    }

    /// A worker context; `multi_threaded` drops per-context ordering.
    pub fn create_worker_context(&self, multi_threaded: bool) -> Result<Context> {
        let kind = if multi_threaded {
            ContextKind::MultiThreadedWorker
        } else {
            ContextKind::Worker
        };
        self.create_context(kind, None)
    }

    /// Create a context of `kind`, optionally tagged with the deployment
    /// that owns it.
    pub fn create_context(&self, kind: ContextKind, deployment: Option<DeploymentId>) -> Result<Context> {
        if self.is_closed() {
            return Err(Error::illegal_state("courier is closed"));
        }
        let index = self.inner.next_loop.fetch_add(1, Ordering::Relaxed) % self.inner.event_loops.len();
        let event_loop = Arc::clone(&self.inner.event_loops[index]);
        let context = Context::new(kind, deployment, event_loop, Arc::clone(&self.inner.workers));

        let mut contexts = self.inner.contexts.lock();
        contexts.retain(|c| c.upgrade().is_some_and(|c| !c.is_closed()));
        contexts.push(context.downgrade());

        tracing::debug!(context = %context.id(), kind = ?kind, "Created context");
        Ok(context)
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Fire `handler` once on `context` after `delay`.
    pub fn set_timer<F>(&self, context: &Context, delay: Duration, handler: F) -> Result<TimerId>
    where
        F: FnOnce(TimerId) + Send + 'static,
    {
        self.inner.timers.set_timer(context, delay, handler)
    }

    /// Fire `handler` on `context` every `delay` until cancelled.
    pub fn set_periodic<F>(&self, context: &Context, delay: Duration, handler: F) -> Result<TimerId>
    where
        F: FnMut(TimerId) + Send + 'static,
    {
        self.inner.timers.set_periodic(context, delay, handler)
    }

    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.inner.timers.cancel_timer(id)
    }

    /// One-shot timer as a stream; scheduled once a handler is attached.
    pub fn timer_stream(&self, context: &Context, delay: Duration) -> TimeoutStream {
        TimeoutStream::new(&self.inner.timers, context.clone(), delay, false)
    }

    pub fn periodic_stream(&self, context: &Context, delay: Duration) -> TimeoutStream {
        TimeoutStream::new(&self.inner.timers, context.clone(), delay, true)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Close every context created here, then stop all runtime threads.
    /// Later calls do nothing.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let contexts: Vec<Context> = {
            let mut contexts = self.inner.contexts.lock();
            contexts.drain(..).filter_map(|c| c.upgrade()).collect()
        };
        tracing::info!("Closing courier with {} live contexts", contexts.len());
        for context in &contexts {
            context.close();
        }
        self.inner.shutdown_threads();
    }
}
