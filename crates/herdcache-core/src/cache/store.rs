//! Durable key/value storage for the persistent cache tier.
//!
//! Stores hold opaque strings and know nothing about entries, TTLs or users.
//! Every operation may fail; the cache manager absorbs those failures.

use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::error::StorageError;

/// Predicate over persisted keys, used for bulk removal.
pub type KeyPredicate<'a> = &'a (dyn Fn(&str) -> bool + Send + Sync);

#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError>;

    /// Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Remove every key matching `predicate`, returning how many were removed.
    async fn remove_where(&self, predicate: KeyPredicate<'_>) -> Result<usize, StorageError> {
        let mut removed = 0;
        for key in self.all_keys().await? {
            if predicate(&key) {
                self.remove(&key).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn all_keys(&self) -> Result<Vec<String>, StorageError>;
}

/// File extension for persisted values
const VALUE_EXT: &str = "json";

/// Suffix for in-progress writes; never listed as keys
const TEMP_SUFFIX: &str = ".tmp";

/// One JSON file per key inside a directory.
///
/// File names are the hex encoding of the key so any key survives the
/// filesystem and can be listed back. Each write goes to its own temp file and
/// is renamed into place, so readers never see a half-written value and
/// concurrent writers to one key never share a temp file.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&dir)
            .map_err(|e| StorageError::Unavailable(format!("{}: {}", dir.display(), e)))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", hex::encode(key), VALUE_EXT))
    }

    fn key_for(file_name: &str) -> Option<String> {
        let stem = file_name.strip_suffix(&format!(".{}", VALUE_EXT))?;
        let bytes = hex::decode(stem).ok()?;
        String::from_utf8(bytes).ok()
    }
}

#[async_trait]
impl PersistentStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(key, e)),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        let dir = self.dir.clone();
        let path = self.path_for(key);
        let owned_key = key.to_string();

        // The temp file removes itself if any step fails
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut temp = tempfile::Builder::new()
                .suffix(TEMP_SUFFIX)
                .tempfile_in(&dir)
                .map_err(|e| StorageError::io(&owned_key, e))?;
            temp.write_all(value.as_bytes())
                .map_err(|e| StorageError::io(&owned_key, e))?;
            temp.persist(&path)
                .map_err(|e| StorageError::io(&owned_key, e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::io(key, e))?
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(key, e)),
        }
    }

    async fn all_keys(&self) -> Result<Vec<String>, StorageError> {
        let dir_label = self.dir.display().to_string();
        let mut reader = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| StorageError::io(&dir_label, e))?;

        let mut keys = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&dir_label, e))?
        {
            let file_name = entry.file_name();
            match file_name.to_str().and_then(Self::key_for) {
                Some(key) => keys.push(key),
                None => debug!(file = ?file_name, "Skipping non-cache file in store directory"),
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Volatile store for tests and for running without a writable cache directory.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.values.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.values.lock().remove(key);
        Ok(())
    }

    async fn remove_where(&self, predicate: KeyPredicate<'_>) -> Result<usize, StorageError> {
        let mut values = self.values.lock();
        let before = values.len();
        values.retain(|key, _| !predicate(key));
        Ok(before - values.len())
    }

    async fn all_keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self.values.lock().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
