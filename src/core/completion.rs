//! Delivery of finished operations to their callers.
//!
//! The reader task must never run caller code. Anything that can be
//! signalled cheaply (a parked thread, an async waker) completes inline;
//! everything else is handed to a background worker, either through a
//! single ordered drain loop or one task per operation.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tracing::{error, trace};

/// Something that can deliver its result to a caller.
pub trait Completable: Send + Sync {
    /// Attempts delivery.
    ///
    /// With `is_async == false` the call is on the reader's thread and an
    /// implementation must refuse (return `false`) if delivering would run
    /// arbitrary caller code. With `is_async == true` it must deliver.
    fn try_complete(&self, is_async: bool) -> bool;
}

/// Snapshot of completion counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionCounters {
    /// Delivered on the caller's thread.
    pub completed_sync: u64,
    /// Delivered by a background worker.
    pub completed_async: u64,
    /// Background deliveries that panicked.
    pub failed_async: u64,
    /// Operations waiting in the ordered queue.
    pub pending: usize,
}

/// Completes operations inline or on background workers.
pub struct CompletionManager {
    name: String,
    preserve_order: bool,
    queue: Mutex<VecDeque<Arc<dyn Completable>>>,
    // 0 means no drain worker owns the queue.
    owner: AtomicU64,
    next_token: AtomicU64,
    completed_sync: AtomicU64,
    completed_async: AtomicU64,
    failed_async: AtomicU64,
    in_flight: AtomicUsize,
    runtime: Option<Handle>,
}

impl CompletionManager {
    /// Creates a manager.
    ///
    /// # Arguments
    ///
    /// * `name` - Used in log output
    /// * `preserve_order` - Deliver background completions in arrival order
    pub fn new(name: impl Into<String>, preserve_order: bool) -> Self {
        Self {
            name: name.into(),
            preserve_order,
            queue: Mutex::new(VecDeque::new()),
            owner: AtomicU64::new(0),
            next_token: AtomicU64::new(1),
            completed_sync: AtomicU64::new(0),
            completed_async: AtomicU64::new(0),
            failed_async: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            runtime: Handle::try_current().ok(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Arc<dyn Completable>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Completes `op` inline if that is safe, otherwise schedules it.
    pub fn complete_sync_or_async(self: &Arc<Self>, op: Arc<dyn Completable>) {
        if op.try_complete(false) {
            self.completed_sync.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if self.preserve_order {
            let was_empty = {
                let mut queue = self.lock();
                let was_empty = queue.is_empty();
                queue.push_back(op);
                was_empty
            };
            if was_empty {
                let this = self.clone();
                self.spawn(move || this.drain());
            }
        } else {
            self.in_flight.fetch_add(1, Ordering::Relaxed);
            let this = self.clone();
            self.spawn(move || {
                this.complete_async(&*op);
                this.in_flight.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        match &self.runtime {
            Some(handle) => {
                handle.spawn_blocking(job);
            }
            None => {
                std::thread::spawn(job);
            }
        }
    }

    fn complete_async(&self, op: &dyn Completable) {
        match catch_unwind(AssertUnwindSafe(|| op.try_complete(true))) {
            Ok(_) => {
                self.completed_async.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.failed_async.fetch_add(1, Ordering::Relaxed);
                error!(manager = %self.name, "completion panicked");
            }
        }
    }

    fn try_claim(&self, token: u64) -> bool {
        self.owner
            .compare_exchange(0, token, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn drain(&self) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        if !self.try_claim(token) {
            trace!(manager = %self.name, "drain already owned");
            return;
        }

        loop {
            let next = self.lock().pop_front();
            if let Some(op) = next {
                self.complete_async(&*op);
                continue;
            }

            self.owner.store(0, Ordering::Release);
            std::thread::yield_now();
            // A producer may have pushed onto the empty queue after our last
            // pop and seen no reason to start a worker.
            if self.lock().is_empty() || !self.try_claim(token) {
                break;
            }
        }
    }

    /// Returns the current counters.
    pub fn counters(&self) -> CompletionCounters {
        CompletionCounters {
            completed_sync: self.completed_sync.load(Ordering::Relaxed),
            completed_async: self.completed_async.load(Ordering::Relaxed),
            failed_async: self.failed_async.load(Ordering::Relaxed),
            pending: self.lock().len() + self.in_flight.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CompletionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionManager")
            .field("name", &self.name)
            .field("preserve_order", &self.preserve_order)
            .field("counters", &self.counters())
            .finish()
    }
}
