use thiserror::Error;

/// Failure of a persistent store operation.
///
/// Never surfaced to screens: the cache logs it and degrades to memory-only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage I/O failed for {key}: {message}")]
    Io { key: String, message: String },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    pub fn io(key: &str, err: impl std::fmt::Display) -> Self {
        StorageError::Io {
            key: key.to_string(),
            message: err.to_string(),
        }
    }
}

/// Errors produced by the cache layer.
///
/// Cloneable because one coalesced fetch result is handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The resource fetcher rejected. Prior cached data is left in place.
    #[error("Fetch failed for {key}: {message}")]
    Fetch { key: String, message: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A cached payload could not be decoded; the key is purged and treated as a miss.
    #[error("Corrupt cache entry {key}: {message}")]
    CorruptEntry { key: String, message: String },

    /// Missing or malformed parameter. Programmer error, raised before any I/O.
    #[error("Cannot build cache key for {resource}: {reason}")]
    KeyConstruction { resource: String, reason: String },

    #[error("Failed to serialize value for {key}: {message}")]
    Serialization { key: String, message: String },
}

impl CacheError {
    pub fn fetch(key: &str, err: &anyhow::Error) -> Self {
        CacheError::Fetch {
            key: key.to_string(),
            message: format!("{:#}", err),
        }
    }

    pub fn key_construction(resource: &str, reason: impl Into<String>) -> Self {
        CacheError::KeyConstruction {
            resource: resource.to_string(),
            reason: reason.into(),
        }
    }

    /// True for failures a screen should show as a (non-blocking) error indicator.
    pub fn is_user_facing(&self) -> bool {
        matches!(self, CacheError::Fetch { .. })
    }
}
