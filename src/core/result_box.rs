//! Pooled result slots for blocking callers.
//!
//! A blocking call parks on a [`ResultBox`] until the reply is delivered or
//! its timeout elapses. Boxes are recycled through a small fixed-capacity
//! [`ResultBoxPool`]; when the pool is empty a fresh box is allocated.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::proto::error::Result;
use crate::proto::frame::Frame;

/// A one-shot slot holding either a reply or a failure.
#[derive(Debug, Default)]
pub struct ResultBox {
    slot: Mutex<Option<Result<Frame>>>,
    ready: Condvar,
}

impl ResultBox {
    /// Creates an empty box.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the outcome and wakes the waiter.
    pub fn set(&self, result: Result<Frame>) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(result);
        self.ready.notify_all();
    }

    /// Waits up to `timeout` for the outcome and takes it.
    ///
    /// Returns `None` on timeout; the box is then still owned by the in-flight
    /// message and a late reply lands here unobserved.
    pub fn wait(&self, timeout: Duration) -> Option<Result<Frame>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = slot.take() {
                return Some(result);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .ready
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            slot = guard;
        }
    }

    /// Returns true when nothing is stored.
    pub fn is_drained(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn reset(&self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Fixed-capacity free list of [`ResultBox`]es.
#[derive(Debug)]
pub struct ResultBoxPool {
    free: Mutex<Vec<Arc<ResultBox>>>,
    capacity: usize,
}

impl ResultBoxPool {
    /// Creates a pool retaining at most `capacity` idle boxes.
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Takes an idle box, or allocates one when the pool is empty.
    pub fn acquire(&self) -> Arc<ResultBox> {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| Arc::new(ResultBox::new()))
    }

    /// Returns a box to the pool.
    ///
    /// The box is kept only if the caller holds the last reference and it has
    /// been drained; a box still referenced by an in-flight message is left
    /// to that message.
    pub fn release(&self, result_box: Arc<ResultBox>) -> bool {
        if Arc::strong_count(&result_box) != 1 || !result_box.is_drained() {
            return false;
        }
        result_box.reset();
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() >= self.capacity {
            return false;
        }
        free.push(result_box);
        true
    }

    /// Number of idle boxes.
    pub fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
