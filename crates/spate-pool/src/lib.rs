#![forbid(unsafe_code)]
//! Bounded object pool with per-node locality hints.
//!
//! Pools bound the number of live objects of a kind (I/O control blocks,
//! user computations) and recycle them to keep allocation off the request
//! path. The fast path is a lock-free [`ArrayQueue`]; the slow path
//! constructs a fresh object while the pool is below capacity.
//!
//! The NUMA `node_id` is a locality *hint*: it is carried for diagnostics
//! and tracing, not enforced as a memory binding.

use crossbeam_queue::ArrayQueue;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Maximum number of simultaneously live objects.
    pub capacity: usize,
    /// Objects currently acquired and not yet released.
    pub outstanding: usize,
    /// Objects parked in the free list.
    pub free: usize,
}

struct PoolInner<T> {
    free: ArrayQueue<T>,
    build: Box<dyn Fn() -> T + Send + Sync>,
    capacity: usize,
    outstanding: AtomicUsize,
    node_id: Option<u32>,
}

/// Bounded pool of `T` with `acquire`/`release` semantics.
///
/// Cloning the handle shares the underlying pool.
pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("Pool")
            .field("capacity", &stats.capacity)
            .field("outstanding", &stats.outstanding)
            .field("free", &stats.free)
            .field("node_id", &self.inner.node_id)
            .finish()
    }
}

impl<T> Pool<T> {
    /// Create a pool bounded to `capacity` live objects.
    ///
    /// Objects are constructed lazily through `build`; nothing is allocated
    /// up front.
    pub fn new<F>(capacity: usize, node_id: Option<u32>, build: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        trace!(
            target: "spate::pool",
            event = "pool_create",
            capacity = capacity,
            node_id = node_id.map_or(-1_i64, i64::from)
        );
        Self {
            inner: Arc::new(PoolInner {
                free: ArrayQueue::new(capacity.max(1)),
                build: Box::new(build),
                capacity: capacity.max(1),
                outstanding: AtomicUsize::new(0),
                node_id,
            }),
        }
    }

    /// Take an object from the pool.
    ///
    /// Returns `None` when `capacity` objects are already outstanding; the
    /// caller must release (or wait for) one before retrying.
    pub fn acquire(&self) -> Option<T> {
        // Reserve a slot first so a concurrent release cannot be double-counted.
        let mut reserved = false;
        let inner = &self.inner;
        let _ = inner
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n < inner.capacity {
                    reserved = true;
                    Some(n + 1)
                } else {
                    reserved = false;
                    None
                }
            });
        if !reserved {
            return None;
        }
        Some(match inner.free.pop() {
            Some(obj) => obj,
            None => (inner.build)(),
        })
    }

    /// Return an object to the pool.
    pub fn release(&self, obj: T) {
        self.inner.outstanding.fetch_sub(1, Ordering::AcqRel);
        // A full free list means more releases than acquires raced past
        // capacity; dropping the object is correct.
        let _ = self.inner.free.push(obj);
    }

    /// Remaining acquisition budget.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner
            .capacity
            .saturating_sub(self.inner.outstanding.load(Ordering::Acquire))
    }

    /// NUMA locality hint supplied at construction.
    #[must_use]
    pub fn node_id(&self) -> Option<u32> {
        self.inner.node_id
    }

    /// Current occupancy snapshot.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.inner.capacity,
            outstanding: self.inner.outstanding.load(Ordering::Acquire),
            free: self.inner.free.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_up_to_capacity() {
        let pool: Pool<Vec<u8>> = Pool::new(2, None, || vec![0_u8; 16]);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.available(), 0);
        pool.release(a);
        assert_eq!(pool.available(), 1);
        let c = pool.acquire().unwrap();
        assert_eq!(c.len(), 16);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn released_objects_are_recycled() {
        let pool: Pool<Box<u64>> = Pool::new(1, Some(0), || Box::new(7));
        let mut obj = pool.acquire().unwrap();
        *obj = 42;
        pool.release(obj);
        // The recycled object keeps its mutated state; callers reset it.
        assert_eq!(*pool.acquire().unwrap(), 42);
    }

    #[test]
    fn concurrent_acquire_release_respects_bound() {
        let pool: Pool<u64> = Pool::new(8, None, || 0);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    if let Some(obj) = pool.acquire() {
                        assert!(pool.stats().outstanding <= 8);
                        pool.release(obj);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.stats().outstanding, 0);
    }
}
