use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Entry<V> {
  value: V,
  expires_at: Instant,
}

pub struct TtlCache<K, V> {
  cache: HashMap<K, Entry<V>>,
  ttl: Duration,
  max_entries: Option<usize>,
}

impl<K, V> TtlCache<K, V>
where
  K: std::cmp::Eq + std::hash::Hash + Clone,
  V: Clone,
{
  pub fn new(ttl: Duration) -> Self {
    Self {
      cache: HashMap::new(),
      ttl,
      max_entries: None,
    }
  }

  /// Caps the cache at `max_entries`. Once reached, inserting a new key evicts the entry with
  /// the earliest expiry first (the TTL context cache's "evict by earliest `expiresAt`" rule).
  pub fn with_max_entries(ttl: Duration, max_entries: usize) -> Self {
    Self {
      cache: HashMap::new(),
      ttl,
      max_entries: Some(max_entries),
    }
  }

  pub fn len(&self) -> usize {
    self.cache.len()
  }

  pub fn is_empty(&self) -> bool {
    self.cache.is_empty()
  }

  /// Inserts with the cache's own default TTL as the entry's expiry.
  pub fn insert(&mut self, key: K, value: V) {
    let expires_at = Instant::now() + self.ttl;
    self.insert_with_expiry(key, value, expires_at);
  }

  /// Inserts with an explicit expiry, capped at the cache's own default TTL — a caller-supplied
  /// deadline can only shorten an entry's life, never extend it past the cache's own bound. Used
  /// by the certificate context cache to retire an entry at the certificate's own `notAfter` when
  /// that falls sooner than the cache's default TTL.
  pub fn insert_with_expiry(&mut self, key: K, value: V, expires_at: Instant) {
    let capped_expiry = expires_at.min(Instant::now() + self.ttl);

    if let Some(max_entries) = self.max_entries {
      if !self.cache.contains_key(&key) && self.cache.len() >= max_entries {
        if let Some(evict_key) = self
          .cache
          .iter()
          .min_by_key(|(_, entry)| entry.expires_at)
          .map(|(k, _)| k.clone())
        {
          self.cache.remove(&evict_key);
        }
      }
    }
    self.cache.insert(key, Entry { value, expires_at: capped_expiry });
  }

  pub fn get(&self, key: &K) -> Option<V> {
    self.cache.get(key).and_then(|entry| {
      if Instant::now() < entry.expires_at {
        Some(entry.value.clone())
      } else {
        None
      }
    })
  }

  #[allow(dead_code)]
  pub fn remove(&mut self, key: &K) -> Option<V> {
    self.cache.remove(key).map(|entry| entry.value)
  }

  pub fn cleanup(&mut self) {
    let now = Instant::now();
    self.cache.retain(|_, entry| entry.expires_at > now);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread::sleep;
  use std::time::Duration;

  #[test]
  fn test_insert_and_get() {
    let mut cache = TtlCache::new(Duration::new(5, 0));
    cache.insert("key1", "value1");

    assert_eq!(cache.get(&"key1"), Some("value1"));
  }

  #[test]
  fn test_get_expired() {
    let mut cache = TtlCache::new(Duration::new(1, 0));
    cache.insert("key1", "value1");

    // Sleep for 2 seconds to ensure the entry expires
    sleep(Duration::new(2, 0));

    assert_eq!(cache.get(&"key1"), None);
  }

  #[test]
  fn test_remove() {
    let mut cache = TtlCache::new(Duration::new(5, 0));
    cache.insert("key1", "value1");
    cache.remove(&"key1");

    assert_eq!(cache.get(&"key1"), None);
  }

  #[test]
  fn test_cleanup() {
    let mut cache = TtlCache::new(Duration::new(1, 0));
    cache.insert("key1", "value1");
    cache.insert("key2", "value2");

    // Sleep for 2 seconds to ensure the entries expire
    sleep(Duration::new(2, 0));

    cache.cleanup();

    assert_eq!(cache.get(&"key1"), None);
    assert_eq!(cache.get(&"key2"), None);
  }

  #[test]
  fn test_get_non_existent() {
    let cache: TtlCache<&str, &str> = TtlCache::new(Duration::new(5, 0));
    assert_eq!(cache.get(&"key1"), None);
  }

  #[test]
  fn test_overflow_evicts_earliest() {
    let mut cache = TtlCache::with_max_entries(Duration::new(60, 0), 2);
    cache.insert("key1", "value1");
    sleep(Duration::from_millis(10));
    cache.insert("key2", "value2");
    sleep(Duration::from_millis(10));
    cache.insert("key3", "value3");

    assert_eq!(cache.get(&"key1"), None);
    assert_eq!(cache.get(&"key2"), Some("value2"));
    assert_eq!(cache.get(&"key3"), Some("value3"));
    assert_eq!(cache.len(), 2);
  }

  #[test]
  fn test_insert_and_get_multiple() {
    let mut cache = TtlCache::new(Duration::new(5, 0));
    cache.insert("key1", "value1");
    cache.insert("key2", "value2");

    assert_eq!(cache.get(&"key1"), Some("value1"));
    assert_eq!(cache.get(&"key2"), Some("value2"));
  }

  #[test]
  fn insert_with_expiry_is_capped_at_default_ttl() {
    let mut cache = TtlCache::new(Duration::from_millis(50));
    // A far-future explicit expiry must not outlive the cache's own default TTL.
    cache.insert_with_expiry("key1", "value1", Instant::now() + Duration::from_secs(3600));
    sleep(Duration::from_millis(100));
    assert_eq!(cache.get(&"key1"), None);
  }

  #[test]
  fn insert_with_expiry_can_shorten_lifetime() {
    let mut cache = TtlCache::new(Duration::from_secs(3600));
    cache.insert_with_expiry("key1", "value1", Instant::now() + Duration::from_millis(10));
    sleep(Duration::from_millis(50));
    assert_eq!(cache.get(&"key1"), None);
  }
}
