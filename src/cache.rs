//! Caching of operation results and parsed documents
//!
//! [`ResultCache`] holds Result Objects of operations that set `cache`,
//! each with its own expiry. [`DocumentCache`] keeps parsed documents keyed
//! by file path and modification time so repeated renders of one file skip
//! the parser.
//!
//! # Configuration
//!
//! The result cache capacity comes from `[cache] capacity` or the
//! `TESSERA_CACHE_SIZE` environment variable; `0` disables caching:
//!
//! ```bash
//! export TESSERA_CACHE_SIZE=0
//! ```

use crate::ast::Document;
use crate::result::ResultObject;
use anyhow::Result;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

/// Cache metrics for observability
#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    /// Live entries pushed out by the LRU bound
    pub evictions: AtomicU64,
    /// Entries found past their expiry
    pub expirations: AtomicU64,
}

impl CacheMetrics {
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.expirations.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of cache metrics at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheMetricsSnapshot {
    /// Hit rate between 0.0 and 1.0
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.hits + self.misses
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
struct CachedResult {
    result: ResultObject,
    expires_at: Instant,
}

/// TTL-bounded LRU store of Result Objects
///
/// Concurrent executions of one key are serialized through
/// [`ResultCache::key_lock`] so a target runs at most once per TTL window.
pub struct ResultCache {
    entries: Option<Mutex<LruCache<String, CachedResult>>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    metrics: Arc<CacheMetrics>,
    capacity: usize,
}

impl ResultCache {
    /// A capacity of zero disables the cache
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            locks: Mutex::new(HashMap::new()),
            metrics: Arc::new(CacheMetrics::default()),
            capacity,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.entries.is_some()
    }

    /// Live entry for `key`; expired entries are removed and count as misses
    pub fn get(&self, key: &str) -> Option<ResultObject> {
        let entries = self.entries.as_ref()?;
        let mut entries = lock(entries);
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.result.clone())
            }
            Some(_) => {
                entries.pop(key);
                self.metrics.expirations.fetch_add(1, Ordering::Relaxed);
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, key: &str, result: ResultObject, ttl: Duration) {
        let Some(entries) = &self.entries else {
            return;
        };
        let mut entries = lock(entries);
        let entry = CachedResult {
            result,
            expires_at: Instant::now() + ttl,
        };
        if let Some((evicted, _)) = entries.push(key.to_string(), entry) {
            if evicted != key {
                self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn invalidate(&self, key: &str) {
        if let Some(entries) = &self.entries {
            lock(entries).pop(key);
        }
    }

    /// Per-key lock serializing executions of one cached operation
    pub fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = lock(&self.locks);
        locks.retain(|_, l| Arc::strong_count(l) > 1);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    pub fn clear(&self) {
        if let Some(entries) = &self.entries {
            lock(entries).clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map(|e| lock(e).len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn metrics(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

/// Cache key combining file path and modification time
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub path: PathBuf,
    pub mtime: SystemTime,
}

impl CacheKey {
    pub fn from_path(path: &std::path::Path) -> Result<Self> {
        let canonical_path = path.canonicalize()?;
        let metadata = std::fs::metadata(&canonical_path)?;
        let mtime = metadata.modified()?;

        Ok(CacheKey {
            path: canonical_path,
            mtime,
        })
    }
}

/// LRU cache of parsed documents
#[derive(Clone)]
pub struct DocumentCache {
    cache: Arc<Mutex<LruCache<CacheKey, Arc<Document>>>>,
    metrics: Arc<CacheMetrics>,
}

impl DocumentCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Arc::new(Mutex::new(LruCache::new(capacity))),
            metrics: Arc::new(CacheMetrics::default()),
        }
    }

    /// Return the cached document or parse the file. A changed modification
    /// time makes the old entry unreachable.
    pub fn get_or_parse<F>(&self, path: &std::path::Path, parse_fn: F) -> Result<Arc<Document>>
    where
        F: FnOnce(&std::path::Path) -> Result<Document>,
    {
        let key = CacheKey::from_path(path)?;

        if let Some(document) = lock(&self.cache).get(&key) {
            self.metrics.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(document));
        }

        self.metrics.misses.fetch_add(1, Ordering::Relaxed);
        let document = Arc::new(parse_fn(path)?);

        let mut cache = lock(&self.cache);
        if cache.push(key, Arc::clone(&document)).is_some() {
            self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(document)
    }

    pub fn len(&self) -> usize {
        lock(&self.cache).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.cache).is_empty()
    }

    pub fn metrics(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Default for DocumentCache {
    fn default() -> Self {
        Self::new(128)
    }
}
