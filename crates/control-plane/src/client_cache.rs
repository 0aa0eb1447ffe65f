use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use object_store::ObjectStore;

pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

/// Cache key: `(namespace, principal)`.
pub type CacheKey = (String, String);

struct Entry {
    token: String,
    client: Arc<dyn ObjectStore>,
    last_used_at: Instant,
}

/// Bounded LRU of per-principal store clients.
///
/// Building an authenticated client is expensive, so hits are reused, but
/// never across tokens: a hit whose cached token differs from the one
/// presented is treated as a miss and evicted, forcing a rebuild with the
/// fresh credential. One lock covers the map and its LRU order.
pub struct UserClientCache {
    inner: Mutex<lru::LruCache<CacheKey, Entry>>,
    ttl: Duration,
}

impl Default for UserClientCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl UserClientCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(lru::LruCache::new(
                NonZeroUsize::new(capacity).expect("cache capacity must be non-zero"),
            )),
            ttl,
        }
    }

    pub fn get(&self, key: &CacheKey, token: &str) -> Option<Arc<dyn ObjectStore>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.get_mut(key) {
            None => None,
            Some(entry) if entry.token != token => {
                inner.pop(key);
                None
            }
            Some(entry) if entry.last_used_at.elapsed() > self.ttl => {
                inner.pop(key);
                None
            }
            Some(entry) => {
                entry.last_used_at = Instant::now();
                Some(entry.client.clone())
            }
        }
    }

    pub fn set(&self, key: CacheKey, token: &str, client: Arc<dyn ObjectStore>) {
        let mut inner = self.inner.lock().unwrap();
        inner.put(
            key,
            Entry {
                token: token.to_string(),
                client,
                last_used_at: Instant::now(),
            },
        );
    }

    /// Sweep entries idle past the TTL. Returns how many were dropped.
    pub fn clean_expired(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<CacheKey> = inner
            .iter()
            .filter(|(_, e)| e.last_used_at.elapsed() > self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.pop(key);
        }
        expired.len()
    }

    pub fn remove(&self, key: &CacheKey) {
        self.inner.lock().unwrap().pop(key);
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use object_store::MemoryStore;

    fn key(principal: &str) -> CacheKey {
        ("ns".to_string(), principal.to_string())
    }

    fn client() -> Arc<dyn ObjectStore> {
        MemoryStore::new()
    }

    #[test]
    fn test_hit_requires_matching_token() {
        let cache = UserClientCache::default();
        cache.set(key("alice"), "token-1", client());

        assert!(cache.get(&key("alice"), "token-1").is_some());
        // A rotated token is a miss, and the stale entry is gone.
        assert!(cache.get(&key("alice"), "token-2").is_none());
        assert!(cache.get(&key("alice"), "token-1").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_ttl_expiry_is_a_miss() {
        let cache = UserClientCache::new(10, Duration::ZERO);
        cache.set(key("alice"), "token-1", client());
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&key("alice"), "token-1").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_evicts_lru_tail() {
        let cache = UserClientCache::new(2, DEFAULT_TTL);
        cache.set(key("a"), "t", client());
        cache.set(key("b"), "t", client());
        // Refresh "a" so that "b" is the tail.
        assert!(cache.get(&key("a"), "t").is_some());
        cache.set(key("c"), "t", client());

        assert!(cache.get(&key("a"), "t").is_some());
        assert!(cache.get(&key("b"), "t").is_none());
        assert!(cache.get(&key("c"), "t").is_some());
    }

    #[test]
    fn test_set_updates_in_place() {
        let cache = UserClientCache::new(2, DEFAULT_TTL);
        cache.set(key("a"), "t1", client());
        cache.set(key("a"), "t2", client());
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key("a"), "t1").is_none());
        // Entry survives as a t2 entry even though the t1 probe missed.
        cache.set(key("a"), "t2", client());
        assert!(cache.get(&key("a"), "t2").is_some());
    }

    #[test]
    fn test_clean_expired_sweeps() {
        let cache = UserClientCache::new(10, Duration::ZERO);
        cache.set(key("a"), "t", client());
        cache.set(key("b"), "t", client());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.clean_expired(), 2);
        assert!(cache.is_empty());
    }
}
