use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use super::entry::CacheEntry;

/// Entries are stored as JSON values behind an `Arc` so readers get a cheap
/// handle to an immutable entry; writers always replace the whole entry.
pub type StoredEntry = Arc<CacheEntry<Value>>;

/// Process-lifetime, bounded map from cache key to entry.
///
/// When an insert would exceed `max_entries`, the entry with the oldest
/// `created_at` is evicted first.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, StoredEntry>>,
    max_entries: usize,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn get(&self, key: &str) -> Option<StoredEntry> {
        self.entries.lock().get(key).cloned()
    }

    pub fn set(&self, key: &str, entry: CacheEntry<Value>) {
        let mut entries = self.entries.lock();
        if !entries.contains_key(key) {
            while entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.created_at)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(evicted) => {
                        debug!(key = %evicted, "Evicting oldest memory cache entry");
                        entries.remove(&evicted);
                    }
                    None => break,
                }
            }
        }
        entries.insert(key.to_string(), Arc::new(entry));
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Remove every entry for which `predicate(key, entry)` holds.
    /// Returns the number removed.
    pub fn delete_where(&self, predicate: impl Fn(&str, &CacheEntry<Value>) -> bool) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, entry| !predicate(key, entry));
        before - entries.len()
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let removed = entries.len();
        entries.clear();
        removed
    }

    pub fn size(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }
}
