//! Caches owned by the workflow: a TTL map for vendor access tokens and a registry of documents
//! currently being processed.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    inserted: Instant,
    expires: Instant,
}

/// Bounded map whose entries expire after a fixed TTL.
///
/// When full, expired entries are dropped first, then the oldest insertion.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<K, Entry<V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: HashMap::new(),
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.insert_at(key, value, Instant::now())
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached value for `key`, computing and caching it on a miss.
    pub fn get_or_try_insert_with<F>(&mut self, key: K, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = fetch()?;
        self.insert(key, value.clone());
        Ok(value)
    }

    fn get_at(&mut self, key: &K, now: Instant) -> Option<V> {
        match self.entries.get(key) {
            Some(entry) if entry.expires > now => Some(entry.value.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn insert_at(&mut self, key: K, value: V, now: Instant) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.entries.retain(|_, e| e.expires > now);
            if self.entries.len() >= self.capacity {
                let oldest = self
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    self.entries.remove(&oldest);
                }
            }
        }
        self.entries.insert(
            key,
            Entry {
                value,
                inserted: now,
                expires: now + self.ttl,
            },
        );
    }
}

/// Keys of operations currently running; a second acquire of the same key fails.
#[derive(Debug, Clone, Default)]
pub struct InFlightRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn try_acquire(&self, key: &str) -> Result<InFlightGuard> {
        if !self.lock().insert(key.to_string()) {
            return Err(Error::ConcurrentOperation(key.to_string()));
        }
        Ok(InFlightGuard {
            registry: self.clone(),
            key: key.to_string(),
        })
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.lock().contains(key)
    }
}

/// Releases its key when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    registry: InFlightRegistry,
    key: String,
}

impl InFlightGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn entries_expire_after_ttl() {
        let mut cache = TtlCache::new(Duration::from_secs(60), 4);
        let t0 = Instant::now();
        cache.insert_at("token", "abc", t0);
        assert_eq!(cache.get_at(&"token", t0 + Duration::from_secs(59)), Some("abc"));
        assert_eq!(cache.get_at(&"token", t0 + Duration::from_secs(60)), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn full_cache_evicts_expired_then_oldest() {
        let mut cache = TtlCache::new(Duration::from_secs(10), 2);
        let t0 = Instant::now();
        cache.insert_at("a", 1, t0);
        cache.insert_at("b", 2, t0 + Duration::from_secs(5));
        cache.insert_at("c", 3, t0 + Duration::from_secs(11));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get_at(&"a", t0 + Duration::from_secs(11)), None);

        cache.insert_at("d", 4, t0 + Duration::from_secs(12));
        let later = t0 + Duration::from_secs(12);
        assert_eq!(cache.get_at(&"b", later), None);
        assert_eq!(cache.get_at(&"c", later), Some(3));
        assert_eq!(cache.get_at(&"d", later), Some(4));
    }

    #[test]
    fn fetch_runs_only_on_miss() {
        let mut cache = TtlCache::new(Duration::from_secs(60), 2);
        let mut calls = 0;
        for _ in 0..3 {
            let token = cache
                .get_or_try_insert_with("vendor", || {
                    calls += 1;
                    Ok("token-1".to_string())
                })
                .unwrap();
            assert_eq!(token, "token-1");
        }
        assert_eq!(calls, 1);
        let failed = cache.get_or_try_insert_with("other", || Err(Error::Vendor("down".into())));
        assert!(failed.is_err());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn in_flight_guard_blocks_duplicates_until_dropped() {
        let registry = InFlightRegistry::new();
        let guard = registry.try_acquire("opp-1:contract").unwrap();
        assert!(registry.is_active("opp-1:contract"));
        assert!(matches!(
            registry.try_acquire("opp-1:contract"),
            Err(Error::ConcurrentOperation(_))
        ));
        assert!(registry.try_acquire("opp-1:disclaimer").is_ok());
        drop(guard);
        assert!(!registry.is_active("opp-1:contract"));
        assert!(registry.try_acquire("opp-1:contract").is_ok());
    }

    #[test]
    fn only_one_thread_wins_a_key() {
        let registry = InFlightRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || match registry.try_acquire("opp-2:contract") {
                    Ok(guard) => {
                        thread::sleep(Duration::from_millis(50));
                        drop(guard);
                        true
                    }
                    Err(_) => false,
                })
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert!(wins >= 1);
        assert!(!registry.is_active("opp-2:contract"));
    }
}
