//! In-process TTL cache.

use super::{Cache, CacheError, TTL_KEY_ABSENT, TTL_NO_EXPIRY};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// Stored value.
#[derive(Debug, Clone)]
struct CachedValue {
    value: String,
    /// When this entry was written.
    stored_at: Instant,
    /// Lifetime, `None` for entries that never expire.
    ttl: Option<Duration>,
}

impl CachedValue {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            stored_at: Instant::now(),
            ttl,
        }
    }

    /// Check if this cache entry has expired.
    fn is_expired(&self) -> bool {
        match self.ttl {
            Some(ttl) => self.stored_at.elapsed() >= ttl,
            None => false,
        }
    }

    fn remaining(&self) -> Option<Duration> {
        self.ttl.map(|ttl| ttl.saturating_sub(self.stored_at.elapsed()))
    }
}

/// Thread-safe TTL cache, bounded to `max_entries`.
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CachedValue>>,
    max_entries: usize,
}

impl MemoryCache {
    /// Create a new memory cache.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries,
        }
    }

    fn read_live(&self, key: &str) -> Result<Option<CachedValue>, CacheError> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        // Expired entries are left for the next write or cleanup
        Ok(entries.get(key).filter(|e| !e.is_expired()).cloned())
    }

    fn write_guard(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<String, CachedValue>>, CacheError> {
        self.entries.write().map_err(|_| poisoned())
    }

    /// Insert while holding the write lock, evicting if at capacity.
    ///
    /// Unexpired entries with a TTL (bans) are never evicted; if nothing else
    /// can go, the map grows past `max_entries` until they expire.
    fn insert_locked(
        &self,
        entries: &mut HashMap<String, CachedValue>,
        key: &str,
        entry: CachedValue,
    ) {
        if entries.len() >= self.max_entries && !entries.contains_key(key) {
            evict_expired_entries(entries);

            // If still at capacity, remove the oldest entry without a TTL
            if entries.len() >= self.max_entries {
                if let Some(oldest) = entries
                    .iter()
                    .filter(|(_, v)| v.ttl.is_none())
                    .min_by_key(|(_, v)| v.stored_at)
                    .map(|(k, _)| k.clone())
                {
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(key.to_string(), entry);
    }

    /// Remove expired entries from the cache.
    pub fn cleanup(&self) {
        if let Ok(mut entries) = self.entries.write() {
            evict_expired_entries(&mut entries);
        }
    }

    /// Get the number of entries in the cache, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(100_000)
    }
}

fn evict_expired_entries(entries: &mut HashMap<String, CachedValue>) {
    entries.retain(|_, v| !v.is_expired());
}

fn poisoned() -> CacheError {
    CacheError::Backend("memory cache lock poisoned".to_string())
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.read_live(key)?.map(|e| e.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut entries = self.write_guard()?;
        self.insert_locked(&mut entries, key, CachedValue::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        let mut entries = self.write_guard()?;
        if entries.get(key).is_some_and(|e| !e.is_expired()) {
            return Ok(false);
        }
        self.insert_locked(&mut entries, key, CachedValue::new(value, ttl));
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, CacheError> {
        let mut entries = self.write_guard()?;
        let current = entries
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.value.as_str());

        if current != expected {
            return Ok(false);
        }
        self.insert_locked(&mut entries, key, CachedValue::new(value, None));
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.read_live(key)?.is_some())
    }

    async fn ttl(&self, key: &str) -> Result<i64, CacheError> {
        let Some(entry) = self.read_live(key)? else {
            return Ok(TTL_KEY_ABSENT);
        };

        Ok(match entry.remaining() {
            Some(remaining) => {
                let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
                i64::try_from(secs).unwrap_or(i64::MAX)
            }
            None => TTL_NO_EXPIRY,
        })
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.entries.read().map(|_| ()).map_err(|_| poisoned())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
