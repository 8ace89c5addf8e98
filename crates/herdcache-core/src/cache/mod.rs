//! Cache & data-freshness layer.
//!
//! A two-tier cache (bounded memory map over a persistent key/value store)
//! with per-resource TTLs, stale-while-revalidate reads, coalesced fetches,
//! segment-bounded pattern invalidation and per-user isolation.
//!
//! Entries are keyed by resource path, normalized parameters and owning user
//! (see [`key`]). Mutations invalidate by [`ResourceKind`], which cascades to
//! every kind derived from it.

pub mod cleanup;
pub mod clock;
pub mod entry;
pub mod error;
pub mod inflight;
pub mod key;
pub mod manager;
pub mod memory;
pub mod resource;
pub mod store;

pub use cleanup::CacheCleanup;
pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::CacheEntry;
pub use error::{CacheError, StorageError};
pub use inflight::{InFlightRegistry, Superseded};
pub use key::{CacheKey, KeyRegistry, Params};
pub use manager::{
    CacheConfig, CacheEvent, CacheManager, CacheResult, CacheStats, GetOptions,
    InvalidationOutcome, PrefixCounts, CACHE_PREFIX,
};
pub use memory::MemoryCache;
pub use resource::{catalog, Resource, ResourceKind};
pub use store::{FileStore, MemoryStore, PersistentStore};
