//! Blocked-thread diagnostics.
//!
//! Event-loop and worker threads publish when their current task started.
//! A background sampler warns about any thread whose task has been running
//! longer than its limit. Diagnostics only: nothing is interrupted.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::{interval, MissedTickBehavior};

/// Start time of the task a thread is currently running.
#[derive(Debug)]
pub(crate) struct ActivitySlot {
    thread_name: String,
    max_execute_time: Duration,
    started: Mutex<Option<Instant>>,
}

impl ActivitySlot {
    pub(crate) fn begin(&self) {
        *self.started.lock() = Some(Instant::now());
    }

    pub(crate) fn end(&self) {
        *self.started.lock() = None;
    }

    fn blocked_for(&self, now: Instant) -> Option<Duration> {
        let started = (*self.started.lock())?;
        let elapsed = now.saturating_duration_since(started);
        (elapsed > self.max_execute_time).then_some(elapsed)
    }
}

/// Samples registered activity slots on an interval.
#[derive(Debug)]
pub struct BlockedThreadChecker {
    slots: Mutex<Vec<Weak<ActivitySlot>>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl BlockedThreadChecker {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(Vec::new()),
            stop_tx: Mutex::new(None),
        })
    }

    /// Track a thread. The slot stops being sampled once dropped.
    pub(crate) fn register(&self, thread_name: &str, max_execute_time: Duration) -> Arc<ActivitySlot> {
        let slot = Arc::new(ActivitySlot {
            thread_name: thread_name.to_string(),
            max_execute_time,
            started: Mutex::new(None),
        });
        self.slots.lock().push(Arc::downgrade(&slot));
        slot
    }

    /// Run one sampling pass. Returns the number of blocked threads.
    pub fn check(&self) -> usize {
        let now = Instant::now();
        let live: Vec<Arc<ActivitySlot>> = {
            let mut slots = self.slots.lock();
            slots.retain(|s| s.strong_count() > 0);
            slots.iter().filter_map(Weak::upgrade).collect()
        };

        let mut blocked = 0;
        for slot in live {
            if let Some(elapsed) = slot.blocked_for(now) {
                blocked += 1;
                tracing::warn!(
                    thread = %slot.thread_name,
                    "Thread {} has been blocked for {} ms, time limit is {} ms",
                    slot.thread_name,
                    elapsed.as_millis(),
                    slot.max_execute_time.as_millis()
                );
            }
        }
        blocked
    }

    /// Start sampling in the background on `handle`.
    pub(crate) fn start(self: &Arc<Self>, handle: &Handle, every: Duration) {
        if every.is_zero() {
            return;
        }
        let (stop_tx, mut stop_rx) = oneshot::channel();
        *self.stop_tx.lock() = Some(stop_tx);
        let checker = Arc::downgrade(self);

        handle.spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match checker.upgrade() {
                            Some(checker) => {
                                checker.check();
                            }
                            None => break,
                        }
                    }
                    _ = &mut stop_rx => {
                        tracing::debug!("blocked_thread_checker_stopped");
                        break;
                    }
                }
            }
        });
    }

    /// Stop the background sampler.
    pub(crate) fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_long_task_is_reported() {
        let checker = BlockedThreadChecker::new();
        let slot = checker.register("courier-eventloop-thread-9", Duration::from_millis(5));
        assert_eq!(checker.check(), 0);

        slot.begin();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(checker.check(), 1);
        assert!(logs_contain("courier-eventloop-thread-9 has been blocked for"));

        slot.end();
        assert_eq!(checker.check(), 0);
    }

    #[test]
    fn test_dropped_slots_are_pruned() {
        let checker = BlockedThreadChecker::new();
        let slot = checker.register("gone", Duration::ZERO);
        slot.begin();
        drop(slot);
        assert_eq!(checker.check(), 0);
        assert!(checker.slots.lock().is_empty());
    }
}
