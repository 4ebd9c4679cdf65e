//! Write serializer: a FIFO mutation queue.
//!
//! ```text
//!  task A ──┐
//!  task B ──┼──► [ slot ] ──► read ─► transform ─► write ─► release
//!  task C ──┘      ▲
//!                  └─ tokio's fair mutex: waiters are served in arrival order
//! ```
//!
//! At most one task holds the slot. A task that fails releases the slot like
//! one that succeeds; its error goes back only to its own caller. There is no
//! timeout: a task that never settles stalls every task behind it, so callers
//! bound their own I/O.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, MutexGuard};

/// Queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Tasks that asked for the slot
    pub submitted: u64,
    /// Tasks that finished with `Ok`
    pub completed: u64,
    /// Tasks that finished with `Err`, or were abandoned while holding the slot
    pub failed: u64,
    /// Tasks currently waiting for the slot
    pub waiting: u64,
}

#[derive(Default)]
struct AtomicQueueStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    waiting: AtomicU64,
}

/// Serializes mutation tasks against one store.
#[derive(Default)]
pub struct MutationQueue {
    slot: Mutex<()>,
    stats: AtomicQueueStats,
}

/// Exclusive right to mutate the store. Released on drop.
pub struct QueueSlot<'q> {
    _guard: MutexGuard<'q, ()>,
    stats: &'q AtomicQueueStats,
    settled: bool,
}

impl QueueSlot<'_> {
    /// Record the outcome and release the slot.
    pub fn finish(mut self, ok: bool) {
        self.settle(ok);
    }

    fn settle(&mut self, ok: bool) {
        if self.settled {
            return;
        }
        self.settled = true;
        let counter = if ok {
            &self.stats.completed
        } else {
            &self.stats.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.settle(false);
    }
}

/// Decrements the waiting counter even if the acquiring future is dropped.
struct Waiting<'q>(&'q AtomicU64);

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl MutationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the slot. Holders are served strictly in arrival order.
    pub async fn acquire(&self) -> QueueSlot<'_> {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        self.stats.waiting.fetch_add(1, Ordering::Relaxed);
        let waiting = Waiting(&self.stats.waiting);
        let guard = self.slot.lock().await;
        drop(waiting);
        QueueSlot {
            _guard: guard,
            stats: &self.stats,
            settled: false,
        }
    }

    /// Run `task` once every earlier task has settled.
    pub async fn run<F, Fut, T, E>(&self, task: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let slot = self.acquire().await;
        let result = task().await;
        slot.finish(result.is_ok());
        result
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            waiting: self.stats.waiting.load(Ordering::Relaxed),
        }
    }
}
