//! Whole-object LRU cache.
//!
//! Serves repeat reads of small objects without touching the disks. An
//! entry is keyed by `(bucket, object)` and validated against the object's
//! modification time; overwrites therefore invalidate naturally.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Largest single object admitted into the cache.
pub const DEFAULT_MAX_CACHED_OBJECT_SIZE: usize = 16 * 1024 * 1024;

/// Default total capacity.
pub const DEFAULT_CACHE_CAPACITY: usize = 256 * 1024 * 1024;

#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    bucket: String,
    object: String,
}

struct CacheEntry {
    mod_time: DateTime<Utc>,
    data: Bytes,
}

struct CacheInner {
    map: HashMap<CacheKey, CacheEntry>,
    // Recency order, least recent first.
    order: Vec<CacheKey>,
    used: usize,
}

/// A bounded LRU of fully materialized objects.
pub struct ObjectCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    max_entry_size: usize,
}

impl ObjectCache {
    #[must_use]
    pub fn new(capacity: usize, max_entry_size: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: Vec::new(),
                used: 0,
            }),
            capacity,
            max_entry_size,
        }
    }

    /// Whether an object of `size` bytes is admissible at all.
    #[must_use]
    pub fn admits(&self, size: u64) -> bool {
        size <= self.max_entry_size as u64 && size <= self.capacity as u64
    }

    /// Look up an object; only returned when the cached copy matches
    /// `mod_time`.
    pub fn get(&self, bucket: &str, object: &str, mod_time: DateTime<Utc>) -> Option<Bytes> {
        let key = CacheKey {
            bucket: bucket.to_string(),
            object: object.to_string(),
        };
        let mut inner = self.inner.lock();
        let lookup = match inner.map.get(&key) {
            None => return None,
            Some(entry) if entry.mod_time == mod_time => Some(entry.data.clone()),
            Some(_) => None,
        };
        let Some(hit) = lookup else {
            // Stale copy from a previous write.
            Self::remove_locked(&mut inner, &key);
            return None;
        };
        if let Some(pos) = inner.order.iter().position(|k| k == &key) {
            let key = inner.order.remove(pos);
            inner.order.push(key);
        }
        Some(hit)
    }

    /// Insert an object copy, evicting least-recently-used entries to make
    /// room. Oversized objects are ignored.
    pub fn put(&self, bucket: &str, object: &str, mod_time: DateTime<Utc>, data: Bytes) {
        if !self.admits(data.len() as u64) {
            return;
        }
        let key = CacheKey {
            bucket: bucket.to_string(),
            object: object.to_string(),
        };
        let mut inner = self.inner.lock();
        Self::remove_locked(&mut inner, &key);
        while inner.used + data.len() > self.capacity {
            let Some(oldest) = inner.order.first().cloned() else {
                break;
            };
            Self::remove_locked(&mut inner, &oldest);
        }
        inner.used += data.len();
        inner.map.insert(key.clone(), CacheEntry { mod_time, data });
        inner.order.push(key);
    }

    /// Drop an object from the cache, if present.
    pub fn invalidate(&self, bucket: &str, object: &str) {
        let key = CacheKey {
            bucket: bucket.to_string(),
            object: object.to_string(),
        };
        let mut inner = self.inner.lock();
        Self::remove_locked(&mut inner, &key);
    }

    fn remove_locked(inner: &mut CacheInner, key: &CacheKey) {
        if let Some(entry) = inner.map.remove(key) {
            inner.used -= entry.data.len();
            if let Some(pos) = inner.order.iter().position(|k| k == key) {
                inner.order.remove(pos);
            }
        }
    }
}

impl Default for ObjectCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY, DEFAULT_MAX_CACHED_OBJECT_SIZE)
    }
}
