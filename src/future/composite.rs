//! AND/OR joins over heterogeneous futures.

use super::{AnyFuture, Future};
use crate::types::{Error, Result};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct CompositeInner {
    components: Vec<Arc<dyn AnyFuture>>,
    outcome: Future<()>,
}

/// A future completed by the combined outcome of its components.
///
/// Components settle concurrently; an atomic counter of settled components
/// decides the single terminal transition, and the outcome itself is a
/// single-assignment [`Future`].
#[derive(Clone)]
pub struct CompositeFuture {
    inner: Arc<CompositeInner>,
}

impl fmt::Debug for CompositeFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeFuture")
            .field("size", &self.inner.components.len())
            .field("outcome", &self.inner.outcome)
            .finish()
    }
}

impl CompositeFuture {
    fn from_components(components: Vec<Arc<dyn AnyFuture>>) -> Self {
        Self {
            inner: Arc::new(CompositeInner {
                components,
                outcome: Future::new(),
            }),
        }
    }

    /// Succeeds once every component succeeds; fails with the first failure.
    pub fn all(components: Vec<Arc<dyn AnyFuture>>) -> Self {
        let composite = Self::from_components(components);
        let total = composite.inner.components.len();
        if total == 0 {
            composite.inner.outcome.try_complete(());
            return composite;
        }

        let succeeded = Arc::new(AtomicUsize::new(0));
        for component in &composite.inner.components {
            let outcome = composite.inner.outcome.clone();
            let succeeded = Arc::clone(&succeeded);
            component.on_settled(Box::new(move |settled| match settled {
                Ok(()) => {
                    if succeeded.fetch_add(1, Ordering::AcqRel) + 1 == total {
                        outcome.try_complete(());
                    }
                }
                Err(cause) => {
                    outcome.try_fail(cause);
                }
            }));
        }
        composite
    }

    /// Succeeds with the first success; fails once all have failed, with the
    /// cause of the last failure.
    pub fn any(components: Vec<Arc<dyn AnyFuture>>) -> Self {
        let composite = Self::from_components(components);
        let total = composite.inner.components.len();
        if total == 0 {
            composite.inner.outcome.try_complete(());
            return composite;
        }

        let failed = Arc::new(AtomicUsize::new(0));
        for component in &composite.inner.components {
            let outcome = composite.inner.outcome.clone();
            let failed = Arc::clone(&failed);
            component.on_settled(Box::new(move |settled| match settled {
                Ok(()) => {
                    outcome.try_complete(());
                }
                Err(cause) => {
                    if failed.fetch_add(1, Ordering::AcqRel) + 1 == total {
                        outcome.try_fail(cause);
                    }
                }
            }));
        }
        composite
    }

    /// Attach the completion handler. It receives this composite on success.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: FnOnce(Result<CompositeFuture>) + Send + 'static,
    {
        let composite = self.clone();
        self.inner
            .outcome
            .set_handler(move |outcome| handler(outcome.clone().map(|()| composite)));
    }

    pub fn size(&self) -> usize {
        self.inner.components.len()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.outcome.is_complete()
    }

    pub fn succeeded(&self) -> bool {
        self.inner.outcome.succeeded()
    }

    pub fn failed(&self) -> bool {
        self.inner.outcome.failed()
    }

    pub fn cause(&self) -> Option<Error> {
        self.inner.outcome.cause()
    }

    fn component(&self, index: usize) -> Result<&Arc<dyn AnyFuture>> {
        self.inner.components.get(index).ok_or_else(|| {
            Error::illegal_argument(format!(
                "index {} out of range for composite of size {}",
                index,
                self.size()
            ))
        })
    }

    pub fn is_complete_at(&self, index: usize) -> Result<bool> {
        Ok(self.component(index)?.is_complete())
    }

    pub fn succeeded_at(&self, index: usize) -> Result<bool> {
        Ok(self.component(index)?.succeeded())
    }

    pub fn failed_at(&self, index: usize) -> Result<bool> {
        let component = self.component(index)?;
        Ok(component.is_complete() && !component.succeeded())
    }

    pub fn cause_at(&self, index: usize) -> Result<Option<Error>> {
        Ok(self.component(index)?.cause())
    }

    /// The value of component `index`, `None` while it has not succeeded.
    pub fn result_at<T: Any + Clone>(&self, index: usize) -> Result<Option<T>> {
        match self.component(index)?.result_any() {
            None => Ok(None),
            Some(value) => value.downcast_ref::<T>().cloned().map(Some).ok_or_else(|| {
                Error::illegal_argument(format!(
                    "component {} does not hold a {}",
                    index,
                    std::any::type_name::<T>()
                ))
            }),
        }
    }
}

impl AnyFuture for CompositeFuture {
    fn is_complete(&self) -> bool {
        CompositeFuture::is_complete(self)
    }

    fn succeeded(&self) -> bool {
        CompositeFuture::succeeded(self)
    }

    fn cause(&self) -> Option<Error> {
        CompositeFuture::cause(self)
    }

    fn result_any(&self) -> Option<&(dyn Any + Send + Sync)> {
        if self.succeeded() {
            Some(self as &(dyn Any + Send + Sync))
        } else {
            None
        }
    }

    fn on_settled(&self, listener: super::SettleListener) {
        self.inner.outcome.on_settled(listener)
    }
}
