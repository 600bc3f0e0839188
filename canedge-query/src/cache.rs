//! Short-lived memoization
//!
//! [`TtlCache`] keeps computed values for a fixed time-to-live, keyed by a
//! deterministic fingerprint of the arguments that produced them. Values are
//! handed out as shared `Arc`s and never mutated.

use crate::types::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Deterministic cache key for a serializable argument set
pub fn fingerprint<K: Serialize + ?Sized>(key: &K) -> Result<String> {
    Ok(serde_json::to_string(key)?)
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: Arc<V>,
    created_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() >= ttl
    }
}

/// Capacity-bounded cache whose entries expire after a fixed TTL
///
/// A zero TTL or zero capacity disables caching: every lookup misses.
#[derive(Debug)]
pub struct TtlCache<V> {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V> TtlCache<V> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero() && self.capacity > 0
    }

    /// Cached value for `key`, computing and storing it on a miss
    ///
    /// Failed computations are returned and not cached.
    pub fn memoize<F>(&self, key: &str, compute: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Result<V>,
    {
        if let Some(value) = self.get(key) {
            log::trace!("Cache hit: {}", key);
            return Ok(value);
        }
        let value = Arc::new(compute()?);
        self.insert(key, Arc::clone(&value));
        Ok(value)
    }

    /// Unexpired value for `key`
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        if !self.is_enabled() {
            return None;
        }
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if !entry.is_expired(self.ttl) => Some(Arc::clone(&entry.value)),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store a value, evicting expired entries and then the oldest ones over capacity
    pub fn insert(&self, key: &str, value: Arc<V>) {
        if !self.is_enabled() {
            return;
        }
        let mut entries = self.lock();
        let ttl = self.ttl;
        entries.retain(|_, entry| !entry.is_expired(ttl));

        while entries.len() >= self.capacity && !entries.contains_key(key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.created_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(oldest) => {
                    entries.remove(&oldest);
                }
                None => break,
            }
        }

        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                created_at: Instant::now(),
            },
        );
    }

    /// Drop expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, entry| !entry.is_expired(ttl));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<V>>> {
        // Entries stay consistent even if a holder panicked
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
