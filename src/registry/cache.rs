//! TTL cache for repository and tag listings.
//!
//! Registry catalogs are slow and rate-limited; the UI polls them
//! aggressively. Entries are keyed by (kind, registry, credential,
//! qualifier) and expire after a fixed TTL.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_TTL: Duration = Duration::from_secs(60);

pub struct QueryCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, Vec<String>)>>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl QueryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn key(kind: &str, registry: &str, cred_id: &str, qualifier: &str) -> String {
        format!("{}|{}|{}|{}", kind, registry, cred_id, qualifier)
    }

    pub fn get(&self, key: &str) -> Option<Vec<String>> {
        let mut entries = self.entries.lock().expect("query cache poisoned");
        match entries.get(key) {
            Some((at, values)) if at.elapsed() < self.ttl => Some(values.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: String, values: Vec<String>) {
        let mut entries = self.entries.lock().expect("query cache poisoned");
        entries.insert(key, (Instant::now(), values));
    }

    /// Drop every cached listing for a credential, e.g. after it was
    /// updated or deleted.
    pub fn invalidate_credential(&self, cred_id: &str) {
        let needle = format!("|{}|", cred_id);
        let mut entries = self.entries.lock().expect("query cache poisoned");
        entries.retain(|key, _| !key.contains(&needle));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_put_round_trip() {
        let cache = QueryCache::default();
        let key = QueryCache::key("repos", "ghcr.io", "cred_1", "");
        assert!(cache.get(&key).is_none());
        cache.put(key.clone(), vec!["org/app".to_string()]);
        assert_eq!(cache.get(&key).unwrap(), vec!["org/app".to_string()]);
    }

    #[test]
    fn test_expiry() {
        let cache = QueryCache::new(Duration::from_millis(0));
        let key = QueryCache::key("tags", "ghcr.io", "cred_1", "org/app");
        cache.put(key.clone(), vec!["latest".to_string()]);
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn test_invalidate_credential() {
        let cache = QueryCache::default();
        let key_a = QueryCache::key("repos", "ghcr.io", "cred_a", "");
        let key_b = QueryCache::key("repos", "ghcr.io", "cred_b", "");
        cache.put(key_a.clone(), vec!["a".to_string()]);
        cache.put(key_b.clone(), vec!["b".to_string()]);
        cache.invalidate_credential("cred_a");
        assert!(cache.get(&key_a).is_none());
        assert!(cache.get(&key_b).is_some());
    }
}
