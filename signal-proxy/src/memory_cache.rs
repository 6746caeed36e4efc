use chrono::Utc;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use crate::models::ValidatedClient;

/// Memory tier of the validation cache: a bounded, recency-ordered map from
/// token fingerprint to validated-client entry. One mutex guards the whole
/// cache; hits are O(1) so contention stays low.
#[derive(Clone)]
pub struct MemoryCache {
    inner: Arc<Mutex<LruCache<String, ValidatedClient>>>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or(NonZeroUsize::new(1).expect("1 is non-zero"));
        Self {
            inner: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    /// Returns the entry and promotes it to most-recently-used.
    pub fn get(&self, key: &str) -> Option<ValidatedClient> {
        let mut guard = self.inner.lock().expect("memory cache lock poisoned");
        guard.get(key).cloned()
    }

    /// Inserts or reorders to most-recently-used, evicting the LRU entry at
    /// capacity.
    pub fn set(&self, key: String, entry: ValidatedClient) {
        let mut guard = self.inner.lock().expect("memory cache lock poisoned");
        guard.put(key, entry);
    }

    pub fn remove(&self, key: &str) {
        let mut guard = self.inner.lock().expect("memory cache lock poisoned");
        guard.pop(key);
    }

    pub fn len(&self) -> usize {
        let guard = self.inner.lock().expect("memory cache lock poisoned");
        guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every expired entry and returns how many were removed. No
    /// background thread; the cleanup task drives this.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut guard = self.inner.lock().expect("memory cache lock poisoned");
        let expired: Vec<String> = guard
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            guard.pop(key);
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn entry(ttl_secs: i64) -> ValidatedClient {
        let now = Utc::now();
        ValidatedClient {
            machine_id: None,
            validated_at: now,
            expires_at: now + Duration::seconds(ttl_secs),
            last_accessed_at: now,
            access_count: 1,
        }
    }

    #[test]
    fn evicts_least_recently_used_at_capacity() {
        let cache = MemoryCache::new(2);
        cache.set("k1".into(), entry(60));
        cache.set("k2".into(), entry(60));
        // Touch k1 so k2 becomes the LRU entry.
        assert!(cache.get("k1").is_some());
        cache.set("k3".into(), entry(60));
        assert!(cache.get("k2").is_none());
        assert!(cache.get("k1").is_some());
        assert!(cache.get("k3").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn cleanup_removes_only_expired_entries() {
        let cache = MemoryCache::new(8);
        cache.set("live".into(), entry(300));
        cache.set("dead".into(), entry(-5));
        assert_eq!(cache.cleanup_expired(), 1);
        assert!(cache.get("dead").is_none());
        assert!(cache.get("live").is_some());
        // Idempotent: a second sweep removes nothing.
        assert_eq!(cache.cleanup_expired(), 0);
    }

    #[test]
    fn capacity_never_exceeded() {
        let cache = MemoryCache::new(3);
        for i in 0..10 {
            cache.set(format!("k{i}"), entry(60));
        }
        assert_eq!(cache.len(), 3);
    }
}
