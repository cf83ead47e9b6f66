//! Delayed-task scheduling with non-blocking cancellation.
//!
//! A delayed task is a small handle: an id plus a wrapper that checks a
//! live-ids set before running. Cancellation removes the id atomically; if
//! the sleep has already fired, the cancel observes "running" and the caller
//! is responsible for making the callback a no-op (batch timers do this by
//! checking their bucket's sequence number).

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Default)]
pub struct DelayScheduler {
    inner: Arc<DelayInner>,
}

#[derive(Default)]
struct DelayInner {
    next_id: AtomicU64,
    live: Mutex<HashSet<u64>>,
}

/// Result of a non-blocking cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    /// The task had not fired; it will never run.
    Canceled,
    /// The task already started (or finished); it was not stopped.
    Running,
}

impl DelayScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `f` to run after `delay` on the runtime. Returns a timer id
    /// usable with [`DelayScheduler::cancel`].
    pub fn schedule<F>(&self, delay: Duration, f: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.live.lock().unwrap().insert(id);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Claim the id; a concurrent cancel that wins here suppresses us.
            if inner.live.lock().unwrap().remove(&id) {
                f();
            }
        });
        id
    }

    /// Non-blocking cancel.
    pub fn cancel(&self, id: u64) -> CancelResult {
        if self.inner.live.lock().unwrap().remove(&id) {
            CancelResult::Canceled
        } else {
            CancelResult::Running
        }
    }

    /// Cancel every task that has not fired yet. Used at client shutdown.
    pub fn clear(&self) {
        self.inner.live.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn canceled_task_never_runs() {
        let scheduler = DelayScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let id = scheduler.schedule(Duration::from_millis(50), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(scheduler.cancel(id), CancelResult::Canceled);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fired_task_reports_running_on_cancel() {
        let scheduler = DelayScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let id = scheduler.schedule(Duration::from_millis(10), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.cancel(id), CancelResult::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_drops_all_pending_tasks() {
        let scheduler = DelayScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let fired = fired.clone();
            scheduler.schedule(Duration::from_millis(30), move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        scheduler.clear();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
