//! Recycling pools for index entry buffers and queued work items.
//!
//! A pool keeps up to `retain` released objects on a lock-free free list and
//! optionally caps how many objects may be checked out at once. Running into
//! the cap is reported to the caller, which turns it into an internal error
//! before any shared state is touched.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

/// Objects that can be handed out again after use.
pub trait Recycle {
    fn fresh() -> Self;
    /// Return to a blank state, keeping allocations.
    fn recycle(&mut self);
}

impl Recycle for Vec<u8> {
    fn fresh() -> Self {
        Vec::new()
    }

    fn recycle(&mut self) {
        self.clear();
    }
}

pub struct Pool<T> {
    free: ArrayQueue<T>,
    outstanding: AtomicUsize,
    limit: Option<usize>,
}

impl<T: Recycle> Pool<T> {
    /// Build a pool retaining up to `retain` idle objects, `prealloc` of which
    /// are created up front. `limit` caps concurrent checkouts.
    pub fn new(retain: usize, prealloc: usize, limit: Option<usize>) -> Self {
        let free = ArrayQueue::new(retain.max(1));
        for _ in 0..prealloc.min(retain.max(1)) {
            let _ = free.push(T::fresh());
        }
        Self {
            free,
            outstanding: AtomicUsize::new(0),
            limit,
        }
    }

    /// Check out an object, or `None` if the checkout limit is reached.
    pub fn try_take(&self) -> Option<T> {
        match self.limit {
            Some(limit) => {
                self.outstanding
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < limit).then_some(n + 1)
                    })
                    .ok()?;
            }
            None => {
                self.outstanding.fetch_add(1, Ordering::AcqRel);
            }
        }
        Some(self.free.pop().unwrap_or_else(T::fresh))
    }

    /// Release an object previously obtained from [`Pool::try_take`].
    pub fn give(&self, mut item: T) {
        item.recycle();
        // a full free list just drops the surplus
        let _ = self.free.push(item);
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Check out an object that returns itself to the pool on drop.
    pub fn checkout(self: &Arc<Self>) -> Option<Pooled<T>> {
        let item = self.try_take()?;
        Some(Pooled {
            item: Some(item),
            pool: Arc::clone(self),
        })
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("idle", &self.free.len())
            .field("outstanding", &self.outstanding.load(Ordering::Relaxed))
            .field("limit", &self.limit)
            .finish()
    }
}

/// Checked-out object owned by a [`Pool`].
pub struct Pooled<T: Recycle> {
    item: Option<T>,
    pool: Arc<Pool<T>>,
}

impl<T: Recycle> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // only taken in Drop
        self.item.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Recycle> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Recycle> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.give(item);
        }
    }
}

impl<T: Recycle + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.item).finish()
    }
}
