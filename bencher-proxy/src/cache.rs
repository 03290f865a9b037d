//! Keyed state with per-entry time-to-live.
//!
//! Backs the per-IP submission buckets, the liar quarantine, and the client
//! registry. Eviction is lazy: expired entries are dropped when touched or
//! when a snapshot walks the map.

use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Concurrent map whose entries expire `ttl` after their last write.
///
/// `get` refreshes the entry's expiry (sliding lifetime); `peek` leaves it
/// untouched, so the entry dies a fixed `ttl` after insertion.
pub struct TtlCache<V> {
    entries: DashMap<String, Entry<V>>,
    ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Look up `key`, extending its lifetime.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        {
            let mut entry = self.entries.get_mut(key)?;
            if entry.expires_at > now {
                entry.expires_at = now + self.ttl;
                return Some(entry.value.clone());
            }
        }
        self.entries.remove(key);
        None
    }

    /// Look up `key` without extending its lifetime.
    pub fn peek(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        {
            let entry = self.entries.get(key)?;
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
        }
        self.entries.remove(key);
        None
    }

    pub fn insert(&self, key: String, value: V) {
        self.entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Drop every entry, live or not.
    pub fn flush(&self) {
        self.entries.clear();
    }

    /// Clone all live entries, sweeping out expired ones on the way.
    pub fn snapshot(&self) -> Vec<(String, V)> {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_and_insert() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("a".to_string(), 1u32);

        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn test_entries_expire() {
        let cache = TtlCache::new(Duration::from_millis(20));
        cache.insert("a".to_string(), 1u32);

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn test_get_slides_expiry_but_peek_does_not() {
        let cache = TtlCache::new(Duration::from_millis(60));
        cache.insert("slid".to_string(), 1u32);
        cache.insert("fixed".to_string(), 2u32);

        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(30));
            cache.get("slid");
            cache.peek("fixed");
        }

        assert_eq!(cache.get("slid"), Some(1));
        assert_eq!(cache.peek("fixed"), None);
    }

    #[test]
    fn test_flush_drops_everything() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("a".to_string(), 1u32);
        cache.insert("b".to_string(), 2u32);

        cache.flush();

        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn test_snapshot_skips_expired() {
        let cache = TtlCache::new(Duration::from_millis(20));
        cache.insert("old".to_string(), 1u32);
        std::thread::sleep(Duration::from_millis(40));
        cache.insert("new".to_string(), 2u32);

        let live = cache.snapshot();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].0, "new");
    }
}
