// Buffer pool — caching allocator for device buffer reuse
//
// Kernels allocate an output buffer on nearly every dispatch, and the
// backward pass frees most of them again right away. Instead of returning
// released storage to the system allocator, the device keeps per-size free
// lists and hands a cached buffer back out on the next allocation of the
// same length.
//
// A cached buffer's contents are stale: every kernel writes all of its
// output elements, so nothing is zeroed on reuse.
//
// Each size bucket holds at most `max_per_bucket` buffers; anything beyond
// that is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Snapshot of the pool's allocation statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Total bytes currently held in the cache (not in use by tensors).
    pub cached_bytes: usize,
    /// Number of individual buffers currently in the cache.
    pub cached_buffers: usize,
    /// Cumulative cache hits (allocations served from the cache).
    pub hits: u64,
    /// Cumulative cache misses (allocations that went to the allocator).
    pub misses: u64,
}

/// Free lists of f32 buffers keyed by element count.
#[derive(Debug)]
pub struct BufferPool {
    buckets: Mutex<HashMap<usize, Vec<Vec<f32>>>>,
    max_per_bucket: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BufferPool {
    pub fn new(max_per_bucket: usize) -> Self {
        BufferPool {
            buckets: Mutex::new(HashMap::new()),
            max_per_bucket,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<usize, Vec<Vec<f32>>>> {
        // A poisoned pool only ever holds spare buffers.
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A buffer of exactly `n` elements, reused from the cache if possible.
    /// The contents are unspecified.
    pub fn alloc(&self, n: usize) -> Vec<f32> {
        let cached = self.lock().get_mut(&n).and_then(|stack| stack.pop());
        match cached {
            Some(buf) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                vec![0.0; n]
            }
        }
    }

    /// Return a buffer to its size bucket.
    pub fn reclaim(&self, buf: Vec<f32>) {
        if self.max_per_bucket == 0 {
            return;
        }
        let mut map = self.lock();
        let stack = map.entry(buf.len()).or_default();
        if stack.len() < self.max_per_bucket {
            stack.push(buf);
        }
    }

    /// Drop every cached buffer.
    pub fn empty_cache(&self) {
        self.lock().clear();
    }

    pub fn stats(&self) -> PoolStats {
        let map = self.lock();
        let mut cached_buffers = 0usize;
        let mut elems = 0usize;
        for (n, stack) in map.iter() {
            cached_buffers += stack.len();
            elems += *n * stack.len();
        }
        PoolStats {
            cached_bytes: elems * std::mem::size_of::<f32>(),
            cached_buffers,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Reset hit/miss counters.
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse_same_size() {
        let pool = BufferPool::new(4);
        let a = pool.alloc(16);
        pool.reclaim(a);
        assert_eq!(pool.stats().cached_buffers, 1);
        assert_eq!(pool.stats().cached_bytes, 64);

        let b = pool.alloc(16);
        assert_eq!(b.len(), 16);
        let c = pool.alloc(8);
        assert_eq!(c.len(), 8);
        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.cached_buffers, 0);
    }

    #[test]
    fn test_bucket_capacity() {
        let pool = BufferPool::new(2);
        for _ in 0..5 {
            pool.reclaim(vec![0.0; 3]);
        }
        assert_eq!(pool.stats().cached_buffers, 2);
        pool.empty_cache();
        assert_eq!(pool.stats().cached_buffers, 0);
        pool.reset_stats();
        assert_eq!(pool.stats().misses, 0);
    }
}
