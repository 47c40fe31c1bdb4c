//! Bounded, time-limited cache of entities read or written by one repository.

use crate::sync::lock;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-repository entity cache.
///
/// Keys are rendered identifiers. Holds at most `capacity` entries, evicting
/// the least recently used; entries older than the TTL are never returned.
#[derive(Debug)]
pub struct EntityCache<E> {
    ttl: Duration,
    entries: Mutex<LruCache<String, (E, Instant)>>,
}

impl<E: Clone> EntityCache<E> {
    /// A capacity of zero is treated as one.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &str) -> Option<E> {
        let mut entries = lock(&self.entries);
        let (entity, stored_at) = entries.get(key)?.clone();
        if stored_at.elapsed() < self.ttl {
            return Some(entity);
        }
        entries.pop(key);
        None
    }

    /// Inserts `entity`, first dropping whatever has expired.
    pub fn put(&self, key: String, entity: E) {
        let mut entries = lock(&self.entries);
        if entries.len() == entries.cap().get() {
            purge(&mut entries, self.ttl);
        }
        entries.put(key, (entity, Instant::now()));
    }

    pub fn remove(&self, key: &str) {
        lock(&self.entries).pop(key);
    }

    /// Drops every expired entry and returns how many went.
    pub fn purge_expired(&self) -> usize {
        purge(&mut lock(&self.entries), self.ttl)
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        lock(&self.entries).cap().get()
    }
}

fn purge<E>(entries: &mut LruCache<String, (E, Instant)>, ttl: Duration) -> usize {
    let expired: Vec<String> = entries
        .iter()
        .filter(|(_, (_, stored_at))| stored_at.elapsed() >= ttl)
        .map(|(key, _)| key.clone())
        .collect();
    for key in &expired {
        entries.pop(key);
    }
    expired.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_expire_after_ttl() {
        let cache = EntityCache::new(Duration::from_millis(20), 8);
        cache.put("1".to_string(), "bolt");
        assert_eq!(cache.get("1"), Some("bolt"));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get("1"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_size_never_exceeds_capacity() {
        let cache = EntityCache::new(Duration::from_secs(60), 3);
        for id in 0..10 {
            cache.put(id.to_string(), id);
            assert!(cache.len() <= 3);
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get("0"), None);
        assert_eq!(cache.get("9"), Some(9));
    }

    #[test]
    fn test_purge_expired_drops_stale_entries() {
        let cache = EntityCache::new(Duration::from_millis(20), 8);
        cache.put("1".to_string(), 1);
        cache.put("2".to_string(), 2);
        std::thread::sleep(Duration::from_millis(30));
        cache.put("3".to_string(), 3);

        assert_eq!(cache.purge_expired(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("3"), Some(3));
    }

    #[test]
    fn test_zero_capacity_holds_one_entry() {
        let cache = EntityCache::new(Duration::from_secs(60), 0);
        assert_eq!(cache.capacity(), 1);
        cache.put("1".to_string(), 1);
        cache.put("2".to_string(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = EntityCache::new(Duration::from_secs(60), 8);
        cache.put("1".to_string(), 1);
        cache.put("2".to_string(), 2);
        cache.remove("1");
        assert_eq!(cache.get("1"), None);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
