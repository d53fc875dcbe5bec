use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Serialize, Deserialize};

/// A decoded block held by the cache.
#[derive(Debug, Clone)]
pub struct CachedBlock {
    pub data: Bytes,
    pub dirty: bool,
    pub loaded_at: Instant,
}

/// Notified synchronously before an entry leaves the cache, so dirty blocks
/// can be flushed before their only in-memory copy is dropped.
pub trait EvictionListener: Send + Sync {
    fn on_evict(&self, index: u32, block: &CachedBlock);
}

/// Bounded block cache: capped by entry count and entry age, with an age
/// sweep that runs at most once per sweep interval.
pub struct BlockCache {
    inner: Mutex<CacheInner>,
    max_age: Duration,
    sweep_interval: Duration,
    listener: Box<dyn EvictionListener>,
    hits: AtomicU64,
    misses: AtomicU64,
}

struct CacheInner {
    map: LruCache<u32, CachedBlock>,
    last_sweep: Instant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl BlockCache {
    pub fn new(
        max_entries: usize,
        max_age: Duration,
        sweep_interval: Duration,
        listener: Box<dyn EvictionListener>,
    ) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).expect("at least one entry");
        BlockCache {
            inner: Mutex::new(CacheInner {
                map: LruCache::new(capacity),
                last_sweep: Instant::now(),
            }),
            max_age,
            sweep_interval,
            listener,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, index: u32) -> Option<CachedBlock> {
        let mut inner = self.inner.lock();
        self.sweep_if_due(&mut inner);

        let cached = inner.map.get(&index).cloned();
        match cached {
            Some(block) if block.loaded_at.elapsed() <= self.max_age => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(block)
            }
            Some(_) => {
                // Present but expired; evict it now.
                if let Some(block) = inner.map.pop(&index) {
                    self.listener.on_evict(index, &block);
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, index: u32, block: CachedBlock) {
        let mut inner = self.inner.lock();
        self.sweep_if_due(&mut inner);

        if let Some((evicted_index, evicted)) = inner.map.push(index, block) {
            // push returns the displaced LRU entry, or the replaced value for
            // the same key; a same-key replacement is superseded, not evicted.
            if evicted_index != index {
                self.listener.on_evict(evicted_index, &evicted);
            }
        }
    }

    /// Mark a cached block dirty in place, if present.
    pub fn mark_dirty(&self, index: u32, dirty: bool) {
        let mut inner = self.inner.lock();
        if let Some(block) = inner.map.get_mut(&index) {
            block.dirty = dirty;
        }
    }

    /// Drop an entry without notifying the listener (freed blocks).
    pub fn discard(&self, index: u32) {
        let mut inner = self.inner.lock();
        inner.map.pop(&index);
    }

    /// Snapshot of all dirty entries, oldest first.
    pub fn dirty_blocks(&self) -> Vec<(u32, Bytes)> {
        let inner = self.inner.lock();
        inner
            .map
            .iter()
            .filter(|(_, block)| block.dirty)
            .map(|(&index, block)| (index, block.data.clone()))
            .collect()
    }

    /// Evict everything, notifying the listener for each entry. Safe to call
    /// between runs; subsequent reads go back to the file.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        while let Some((index, block)) = inner.map.pop_lru() {
            self.listener.on_evict(index, &block);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            size: inner.map.len(),
            max_entries: inner.map.cap().get(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn sweep_if_due(&self, inner: &mut CacheInner) {
        if inner.last_sweep.elapsed() < self.sweep_interval {
            return;
        }
        inner.last_sweep = Instant::now();

        let expired: Vec<u32> = inner
            .map
            .iter()
            .filter(|(_, block)| block.loaded_at.elapsed() > self.max_age)
            .map(|(&index, _)| index)
            .collect();
        for index in expired {
            if let Some(block) = inner.map.pop(&index) {
                self.listener.on_evict(index, &block);
            }
        }
    }
}
