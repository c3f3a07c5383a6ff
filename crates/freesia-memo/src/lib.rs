//! Memoization tiers for script capabilities.
//!
//! Two tiers back the `lazy_once` and `memoize` capabilities: a lazy tier
//! whose entries live for the process lifetime, and a timed tier whose
//! entries expire after a TTL (checked when read). Keys are caller-supplied
//! strings and are global across objects; the tiers are separate keyspaces.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde_json::Value;

const DEFAULT_TTL: Duration = Duration::from_secs(60);

struct TimedEntry {
  value: Value,
  expires_at: Instant,
}

/// Shared memoization cache. Clones share the same underlying tiers.
#[derive(Clone)]
pub struct MemoCache {
  lazy: Arc<RwLock<HashMap<String, Value>>>,
  timed: Arc<RwLock<HashMap<String, TimedEntry>>>,
  default_ttl: Duration,
}

impl MemoCache {
  pub fn new() -> Self {
    Self::with_default_ttl(DEFAULT_TTL)
  }

  /// Create a cache with a custom default TTL for the timed tier.
  pub fn with_default_ttl(default_ttl: Duration) -> Self {
    Self {
      lazy: Arc::new(RwLock::new(HashMap::new())),
      timed: Arc::new(RwLock::new(HashMap::new())),
      default_ttl,
    }
  }

  /// Look up a lazy-tier entry.
  pub fn get_lazy(&self, key: &str) -> Option<Value> {
    let entries = self.lazy.read().unwrap();
    entries.get(key).cloned()
  }

  /// Store a lazy-tier entry. Lives until the process exits.
  pub fn insert_lazy(&self, key: &str, value: Value) {
    let mut entries = self.lazy.write().unwrap();
    entries.insert(key.to_string(), value);
  }

  /// Look up a timed-tier entry, removing it if it has expired.
  pub fn get_timed(&self, key: &str) -> Option<Value> {
    {
      let entries = self.timed.read().unwrap();
      match entries.get(key) {
        Some(entry) if entry.expires_at > Instant::now() => {
          return Some(entry.value.clone());
        }
        Some(_) => {}
        None => return None,
      }
    }

    // Expired: drop it under the write lock.
    let mut entries = self.timed.write().unwrap();
    entries.remove(key);
    None
  }

  /// Store a timed-tier entry. `ttl` falls back to the cache default.
  pub fn insert_timed(&self, key: &str, value: Value, ttl: Option<Duration>) {
    let ttl = ttl.unwrap_or(self.default_ttl);
    let mut entries = self.timed.write().unwrap();
    entries.insert(
      key.to_string(),
      TimedEntry {
        value,
        expires_at: Instant::now() + ttl,
      },
    );
  }
}

impl Default for MemoCache {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_lazy_entries_persist() {
    let cache = MemoCache::new();

    assert_eq!(cache.get_lazy("k"), None);
    cache.insert_lazy("k", json!(10));
    assert_eq!(cache.get_lazy("k"), Some(json!(10)));
  }

  #[test]
  fn test_timed_entries_expire() {
    let cache = MemoCache::with_default_ttl(Duration::from_millis(20));

    cache.insert_timed("k", json!("cached"), None);
    assert_eq!(cache.get_timed("k"), Some(json!("cached")));

    std::thread::sleep(Duration::from_millis(40));
    assert_eq!(cache.get_timed("k"), None);
  }

  #[test]
  fn test_timed_explicit_ttl_overrides_default() {
    let cache = MemoCache::with_default_ttl(Duration::from_millis(5));

    cache.insert_timed("k", json!(1), Some(Duration::from_secs(60)));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(cache.get_timed("k"), Some(json!(1)));
  }

  #[test]
  fn test_tiers_are_separate_keyspaces() {
    let cache = MemoCache::new();

    cache.insert_lazy("k", json!("lazy"));
    cache.insert_timed("k", json!("timed"), None);

    assert_eq!(cache.get_lazy("k"), Some(json!("lazy")));
    assert_eq!(cache.get_timed("k"), Some(json!("timed")));
  }

  #[test]
  fn test_clones_share_entries() {
    let cache = MemoCache::new();
    let handle = cache.clone();

    handle.insert_lazy("k", json!(true));
    assert_eq!(cache.get_lazy("k"), Some(json!(true)));
  }
}
