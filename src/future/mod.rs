//! Single-assignment asynchronous results.
//!
//! A [`Future`] moves from pending to succeeded or failed exactly once. One
//! completion handler may be attached; when the future is bound to a
//! [`Context`] the handler always runs on that context, even when attached
//! after completion. A handler attached to an unbound future that is already
//! complete never runs before `set_handler` returns: it is queued on the
//! caller's context, or on the shared deferral thread outside any context.
//!
//! [`CompositeFuture`] joins several futures with AND (`all`) or OR (`any`)
//! semantics.

mod composite;

pub use composite::CompositeFuture;

use crate::context::Context;
use crate::types::{Error, Result};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{mpsc, Arc, OnceLock};

type Callback<T> = Box<dyn FnOnce(&Result<T>) + Send>;
type Deferred = Box<dyn FnOnce() + Send>;

/// Settlement listener used by composites: `Ok(())` or the failure cause.
pub(crate) type SettleListener = Box<dyn FnOnce(std::result::Result<(), Error>) + Send>;

struct Callbacks<T> {
    handler: Option<Callback<T>>,
    listeners: Vec<SettleListener>,
}

struct FutureInner<T> {
    outcome: OnceLock<Result<T>>,
    callbacks: Mutex<Callbacks<T>>,
    context: Option<Context>,
}

/// A single-assignment result cell.
pub struct Future<T> {
    inner: Arc<FutureInner<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.outcome.get() {
            None => "pending",
            Some(Ok(_)) => "succeeded",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("Future")
            .field("state", &state)
            .field("context", &self.inner.context.as_ref().map(|c| c.id().clone()))
            .finish()
    }
}

impl<T: Send + Sync + 'static> Default for Future<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> Future<T> {
    /// Create a pending future whose handler runs on the completing thread.
    pub fn new() -> Self {
        Self::with_context(None)
    }

    /// Create a pending future whose handler runs on `context`.
    pub fn on_context(context: Context) -> Self {
        Self::with_context(Some(context))
    }

    fn with_context(context: Option<Context>) -> Self {
        Self {
            inner: Arc::new(FutureInner {
                outcome: OnceLock::new(),
                callbacks: Mutex::new(Callbacks {
                    handler: None,
                    listeners: Vec::new(),
                }),
                context,
            }),
        }
    }

    /// An already succeeded future.
    pub fn succeeded_future(value: T) -> Self {
        let future = Self::new();
        future.try_complete(value);
        future
    }

    /// An already failed future.
    pub fn failed_future(cause: Error) -> Self {
        let future = Self::new();
        future.try_fail(cause);
        future
    }

    /// Succeed the future. Fails with `IllegalState` if already complete.
    pub fn complete(&self, value: T) -> Result<()> {
        if self.try_complete(value) {
            Ok(())
        } else {
            Err(Error::illegal_state("result is already complete"))
        }
    }

    /// Fail the future. Fails with `IllegalState` if already complete.
    pub fn fail(&self, cause: Error) -> Result<()> {
        if self.try_fail(cause) {
            Ok(())
        } else {
            Err(Error::illegal_state("result is already complete"))
        }
    }

    /// Succeed the future unless it is already complete.
    pub fn try_complete(&self, value: T) -> bool {
        self.try_settle(Ok(value))
    }

    /// Fail the future unless it is already complete.
    pub fn try_fail(&self, cause: Error) -> bool {
        self.try_settle(Err(cause))
    }

    /// Complete with an outcome, ignoring the call when already complete.
    pub fn handle(&self, outcome: Result<T>) {
        if !self.try_settle(outcome) {
            tracing::trace!("ignoring outcome for already completed future");
        }
    }

    fn try_settle(&self, outcome: Result<T>) -> bool {
        if self.inner.outcome.set(outcome).is_err() {
            return false;
        }
        let (handler, listeners) = {
            let mut callbacks = self.inner.callbacks.lock();
            (
                callbacks.handler.take(),
                std::mem::take(&mut callbacks.listeners),
            )
        };
        for listener in listeners {
            listener(self.settlement());
        }
        if let Some(handler) = handler {
            self.dispatch(handler, false);
        }
        true
    }

    /// Attach the completion handler, replacing any handler not yet fired.
    ///
    /// Fires immediately but asynchronously when the future is already
    /// complete: through the bound context if any, otherwise queued behind
    /// the caller.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        let mut callbacks = self.inner.callbacks.lock();
        if self.inner.outcome.get().is_some() {
            drop(callbacks);
            self.dispatch(Box::new(handler), true);
        } else {
            callbacks.handler = Some(Box::new(handler));
        }
    }

    fn dispatch(&self, handler: Callback<T>, late: bool) {
        let future = self.clone();
        let fire = move || {
            if let Some(outcome) = future.inner.outcome.get() {
                handler(outcome);
            }
        };
        match &self.inner.context {
            Some(context) => context.run_on_context(fire),
            None if late => defer(Box::new(fire)),
            None => fire(),
        }
    }

    fn settlement(&self) -> std::result::Result<(), Error> {
        match self.inner.outcome.get() {
            Some(Ok(_)) => Ok(()),
            Some(Err(e)) => Err(e.clone()),
            None => Err(Error::internal("settlement requested for pending future")),
        }
    }

    /// Register an internal listener, invoked inline on the completing thread.
    pub(crate) fn on_settled(&self, listener: SettleListener) {
        let mut callbacks = self.inner.callbacks.lock();
        if self.inner.outcome.get().is_some() {
            drop(callbacks);
            listener(self.settlement());
        } else {
            callbacks.listeners.push(listener);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.inner.outcome.get().is_some()
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.inner.outcome.get(), Some(Ok(_)))
    }

    pub fn failed(&self) -> bool {
        matches!(self.inner.outcome.get(), Some(Err(_)))
    }

    /// The failure cause, if the future failed.
    pub fn cause(&self) -> Option<Error> {
        match self.inner.outcome.get() {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// Borrow the outcome, if complete.
    pub fn outcome(&self) -> Option<&Result<T>> {
        self.inner.outcome.get()
    }

    /// A copy of the value, if the future succeeded.
    pub fn result(&self) -> Option<T>
    where
        T: Clone,
    {
        match self.inner.outcome.get() {
            Some(Ok(v)) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn context(&self) -> Option<&Context> {
        self.inner.context.as_ref()
    }

    /// Type-erased view used by [`CompositeFuture`].
    pub fn erased(&self) -> Arc<dyn AnyFuture> {
        Arc::new(self.clone())
    }
}

// =============================================================================
// Deferral
// =============================================================================

/// Queue `task` behind the current call: on the caller's context when there
/// is one, otherwise on a shared thread started on first use.
fn defer(task: Deferred) {
    if let Some(context) = Context::current() {
        context.run_on_context(task);
        return;
    }

    static DEFERRED: OnceLock<Option<mpsc::Sender<Deferred>>> = OnceLock::new();
    let sender = DEFERRED.get_or_init(|| {
        let (tx, rx) = mpsc::channel::<Deferred>();
        let spawned = std::thread::Builder::new()
            .name("courier-deferred".to_string())
            .spawn(move || {
                for task in rx {
                    if std::panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        tracing::error!("Deferred future handler panicked");
                    }
                }
            });
        match spawned {
            Ok(_) => Some(tx),
            Err(e) => {
                tracing::error!("Failed to start deferral thread: {}", e);
                None
            }
        }
    });

    match sender {
        Some(sender) => {
            if let Err(mpsc::SendError(task)) = sender.send(task) {
                task();
            }
        }
        None => task(),
    }
}

/// Type-erased future, so composites can join futures of different types.
pub trait AnyFuture: Send + Sync + fmt::Debug {
    fn is_complete(&self) -> bool;
    fn succeeded(&self) -> bool;
    fn cause(&self) -> Option<Error>;
    fn result_any(&self) -> Option<&(dyn Any + Send + Sync)>;
    #[doc(hidden)]
    fn on_settled(&self, listener: SettleListener);
}

impl<T: Send + Sync + 'static> AnyFuture for Future<T> {
    fn is_complete(&self) -> bool {
        Future::is_complete(self)
    }

    fn succeeded(&self) -> bool {
        Future::succeeded(self)
    }

    fn cause(&self) -> Option<Error> {
        Future::cause(self)
    }

    fn result_any(&self) -> Option<&(dyn Any + Send + Sync)> {
        match self.inner.outcome.get() {
            Some(Ok(v)) => Some(v as &(dyn Any + Send + Sync)),
            _ => None,
        }
    }

    fn on_settled(&self, listener: SettleListener) {
        Future::on_settled(self, listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_complete_once() {
        let future = Future::new();
        assert!(!future.is_complete());
        future.complete(5u32).unwrap();
        assert!(future.succeeded());
        assert_eq!(future.result(), Some(5));

        let err = future.complete(6).unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
        let err = future.fail(Error::failed("late")).unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
        assert_eq!(future.result(), Some(5));
    }

    #[test]
    fn test_try_variants_report_race() {
        let future: Future<u32> = Future::new();
        assert!(future.try_fail(Error::failed("first")));
        assert!(!future.try_complete(1));
        assert!(!future.try_fail(Error::failed("second")));
        assert_eq!(future.cause().unwrap().to_string(), "first");
        assert!(future.failed());
    }

    #[test]
    fn test_handler_before_completion() {
        let future = Future::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        future.set_handler(move |r: &Result<usize>| {
            s.store(*r.as_ref().unwrap(), Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        future.complete(9).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn test_handler_after_completion_fires_asynchronously() {
        let future: Future<()> = Future::failed_future(Error::failed("nope"));
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (tx, rx) = mpsc::channel();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        future.set_handler(move |r| {
            // Hold the handler until set_handler has returned
            let _ = started_rx.recv_timeout(Duration::from_secs(5));
            f.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(r.is_err());
        });
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        started_tx.send(()).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_handler_on_succeeded_future_is_not_inline() {
        let future = Future::succeeded_future(7u32);
        let caller = std::thread::current().id();
        let (tx, rx) = mpsc::channel();
        future.set_handler(move |r| {
            let _ = tx.send((*r.as_ref().unwrap(), std::thread::current().id()));
        });
        let (value, thread) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(value, 7);
        assert_ne!(thread, caller);
    }

    #[test]
    fn test_handler_fires_once_under_concurrent_completion() {
        for _ in 0..50 {
            let future: Future<usize> = Future::new();
            let fired = Arc::new(AtomicUsize::new(0));
            let f = fired.clone();
            future.set_handler(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            });
            let threads: Vec<_> = (0..4)
                .map(|i| {
                    let fut = future.clone();
                    std::thread::spawn(move || fut.try_complete(i))
                })
                .collect();
            let winners = threads
                .into_iter()
                .map(|t| t.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(winners, 1);
            assert_eq!(fired.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_erased_view() {
        let future = Future::succeeded_future("hello".to_string());
        let erased = future.erased();
        assert!(erased.is_complete());
        assert!(erased.succeeded());
        let value = erased.result_any().unwrap().downcast_ref::<String>();
        assert_eq!(value.map(String::as_str), Some("hello"));
    }
}
