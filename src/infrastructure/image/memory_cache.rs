//! In-memory LRU image cache with count and cost limits.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::domain::entities::{CacheKey, WebImage};

/// Default maximum number of images to keep in memory.
pub const DEFAULT_COUNT_LIMIT: usize = 100;

/// Default maximum total cost (decoded bytes) to keep in memory.
pub const DEFAULT_COST_LIMIT: u64 = 100 * 1024 * 1024;

struct Entry {
    image: Arc<WebImage>,
    cost: u64,
}

struct Inner {
    lru: LruCache<CacheKey, Entry>,
    total_cost: u64,
}

/// In-memory LRU cache for decoded images.
/// Thread-safe; every call holds the lock only for the map operation.
pub struct MemoryImageCache {
    name: String,
    inner: Mutex<Inner>,
    count_limit: usize,
    cost_limit: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryImageCache {
    /// Creates a new cache with the given limits.
    #[must_use]
    pub fn new(name: impl Into<String>, count_limit: usize, cost_limit: u64) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                lru: LruCache::unbounded(),
                total_cost: 0,
            }),
            count_limit: count_limit.max(1),
            cost_limit,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Creates a new cache with the default limits.
    #[must_use]
    pub fn with_default_limits(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_COUNT_LIMIT, DEFAULT_COST_LIMIT)
    }

    /// Cache name, used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum number of entries.
    #[must_use]
    pub const fn count_limit(&self) -> usize {
        self.count_limit
    }

    /// Maximum total cost.
    #[must_use]
    pub const fn cost_limit(&self) -> u64 {
        self.cost_limit
    }

    /// Returns an image and marks it most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<WebImage>> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.lru.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(cache = %self.name, key = %key, "Memory cache hit");
            Some(entry.image.clone())
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(cache = %self.name, key = %key, "Memory cache miss");
            None
        }
    }

    /// Peeks at an image without promoting it in the LRU.
    pub fn peek(&self, key: &CacheKey) -> Option<Arc<WebImage>> {
        self.inner.lock().lru.peek(key).map(|e| e.image.clone())
    }

    /// Stores an image with the given cost, evicting least recently used
    /// entries until both limits hold again.
    pub fn set(&self, key: CacheKey, image: Arc<WebImage>, cost: u64) {
        let mut inner = self.inner.lock();
        debug!(cache = %self.name, key = %key, cost, "Storing image in memory cache");
        if let Some(old) = inner.lru.put(key, Entry { image, cost }) {
            inner.total_cost -= old.cost;
        }
        inner.total_cost += cost;
        self.trim(&mut inner);
    }

    /// Removes an image.
    pub fn remove(&self, key: &CacheKey) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.lru.pop(key) {
            inner.total_cost -= old.cost;
            debug!(cache = %self.name, key = %key, "Evicted image from memory cache");
        }
    }

    /// Returns true if the key is cached. Does not promote.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().lru.contains(key)
    }

    /// Number of cached images.
    pub fn total_count(&self) -> usize {
        self.inner.lock().lru.len()
    }

    /// Sum of the costs of all cached images.
    pub fn total_cost(&self) -> u64 {
        self.inner.lock().total_cost
    }

    /// Removes every image.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.lru.clear();
        inner.total_cost = 0;
        debug!(cache = %self.name, "Cleared memory image cache");
    }

    /// Returns cache statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        let inner = self.inner.lock();
        CacheStats {
            hits,
            misses,
            hit_rate,
            size: inner.lru.len(),
            cost: inner.total_cost,
        }
    }

    fn trim(&self, inner: &mut Inner) {
        while inner.lru.len() > self.count_limit || inner.total_cost > self.cost_limit {
            let Some((key, entry)) = inner.lru.pop_lru() else {
                break;
            };
            inner.total_cost -= entry.cost;
            trace!(cache = %self.name, key = %key, "Memory cache trimmed entry");
        }
    }
}

impl Default for MemoryImageCache {
    fn default() -> Self {
        Self::with_default_limits("memory")
    }
}

impl std::fmt::Debug for MemoryImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryImageCache")
            .field("name", &self.name)
            .field("count_limit", &self.count_limit)
            .field("cost_limit", &self.cost_limit)
            .finish_non_exhaustive()
    }
}

/// Statistics about cache performance.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Hit rate as a percentage.
    pub hit_rate: f64,
    /// Current number of cached images.
    pub size: usize,
    /// Current total cost in bytes.
    pub cost: u64,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cache: {} images ({} bytes), {:.1}% hit rate ({} hits, {} misses)",
            self.size, self.cost, self.hit_rate, self.hits, self.misses
        )
    }
}
