//! Address table with round-robin selection.
//!
//! Each address maps to a copy-on-write list of handlers. Senders load a
//! snapshot without locking; writers swap in a new list under the map entry
//! guard. The round-robin cursor survives list changes and is re-clamped to
//! the new length on every add and remove.

use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Handlers registered at one address.
pub(crate) struct Handlers<H> {
    list: ArcSwap<Vec<H>>,
    pos: AtomicUsize,
}

impl<H: Clone> Handlers<H> {
    fn new() -> Self {
        Self {
            list: ArcSwap::from_pointee(Vec::new()),
            pos: AtomicUsize::new(0),
        }
    }

    /// Next handler in round-robin order.
    pub(crate) fn choose(&self) -> Option<H> {
        let list = self.list.load();
        if list.is_empty() {
            return None;
        }
        let pos = self.pos.fetch_add(1, Ordering::AcqRel) % list.len();
        Some(list[pos].clone())
    }

    /// Current snapshot, for fan-out.
    pub(crate) fn snapshot(&self) -> Arc<Vec<H>> {
        self.list.load_full()
    }

    pub(crate) fn len(&self) -> usize {
        self.list.load().len()
    }

    fn clamp(&self, len: usize) {
        if len > 0 {
            let pos = self.pos.load(Ordering::Acquire);
            self.pos.store(pos % len, Ordering::Release);
        } else {
            self.pos.store(0, Ordering::Release);
        }
    }
}

/// Address -> handlers.
pub(crate) struct HandlerTable<H> {
    map: DashMap<String, Arc<Handlers<H>>>,
}

impl<H> fmt::Debug for HandlerTable<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("addresses", &self.map.len())
            .finish()
    }
}

impl<H: Clone> HandlerTable<H> {
    pub(crate) fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    pub(crate) fn add(&self, address: &str, handler: H) {
        let entry = self
            .map
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Handlers::new()));
        let handlers = entry.value();
        let mut list = Vec::clone(&handlers.list.load());
        list.push(handler);
        let len = list.len();
        handlers.list.store(Arc::new(list));
        handlers.clamp(len);
    }

    /// Remove the first handler matching `is_target`. Drops the address once
    /// its last handler is gone.
    pub(crate) fn remove<F>(&self, address: &str, is_target: F) -> bool
    where
        F: Fn(&H) -> bool,
    {
        match self.map.entry(address.to_string()) {
            Entry::Occupied(entry) => {
                let handlers = entry.get();
                let current = handlers.list.load();
                let Some(index) = current.iter().position(|h| is_target(h)) else {
                    return false;
                };
                let mut list = Vec::clone(&current);
                list.remove(index);
                drop(current);
                if list.is_empty() {
                    handlers.list.store(Arc::new(list));
                    handlers.clamp(0);
                    entry.remove();
                } else {
                    let len = list.len();
                    handlers.list.store(Arc::new(list));
                    handlers.clamp(len);
                }
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    pub(crate) fn get(&self, address: &str) -> Option<Arc<Handlers<H>>> {
        self.map.get(address).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn count(&self, address: &str) -> usize {
        self.map.get(address).map(|entry| entry.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn total(&self) -> usize {
        self.map.iter().map(|entry| entry.len()).sum()
    }
}
