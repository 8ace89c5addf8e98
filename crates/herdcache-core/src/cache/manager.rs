//! The two-tier cache orchestrator.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::entry::CacheEntry;
use super::error::CacheError;
use super::inflight::{InFlight, InFlightRegistry, Superseded};
use super::key::{CacheKey, KeyRegistry, Params};
use super::memory::MemoryCache;
use super::resource::{Resource, ResourceKind};
use super::store::PersistentStore;

/// Namespace for cache entries in the persistent store. Other collaborators
/// (the session) keep their own prefixes in the same store.
pub const CACHE_PREFIX: &str = "cache:";

/// Default cap on memory entries.
/// A few hundred covers every list and detail view of a large operation.
const DEFAULT_MAX_MEMORY_ENTRIES: usize = 500;

/// Minimum gap between focus-triggered refreshes of one hook.
/// Long enough to absorb a modal dismiss re-focusing the screen.
const DEFAULT_FOCUS_COOLDOWN: Duration = Duration::from_secs(2);

/// Buffer size for the cache event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_memory_entries: usize,
    pub focus_cooldown: Duration,
    /// Replaces the catalog TTL for every resource of a kind.
    pub ttl_overrides: HashMap<ResourceKind, Duration>,
    pub event_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_entries: DEFAULT_MAX_MEMORY_ENTRIES,
            focus_cooldown: DEFAULT_FOCUS_COOLDOWN,
            ttl_overrides: HashMap::new(),
            event_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_memory_entries = max;
        self
    }

    pub fn with_focus_cooldown(mut self, cooldown: Duration) -> Self {
        self.focus_cooldown = cooldown;
        self
    }

    pub fn with_ttl_override(mut self, kind: ResourceKind, ttl: Duration) -> Self {
        self.ttl_overrides.insert(kind, ttl);
        self
    }
}

/// Per-call knobs for [`CacheManager::get_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// TTL for the entry written by this call; defaults to the resource's.
    pub ttl: Option<Duration>,
    /// Skip both tiers and go to the fetcher (still coalesced).
    pub force_fetch: bool,
}

impl GetOptions {
    pub fn forced() -> Self {
        Self {
            force_fetch: true,
            ..Self::default()
        }
    }
}

/// Outcome of a cache read.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheResult<T> {
    pub value: T,
    pub from_cache: bool,
    /// The value is past its TTL; a background refresh has been started.
    pub stale: bool,
    pub cached_at: DateTime<Utc>,
}

/// Notifications for observers such as data hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A fetch result (or a direct `set`) replaced the entry for `key`.
    Updated { key: String },
    /// A fetch for `key` failed; any existing entry was left in place.
    RefreshFailed { key: String, message: String },
    Invalidated { pattern: String },
    /// Entries owned by `scope` (or every entry, for `None`) were removed.
    Cleared { scope: Option<String> },
}

/// Entries removed by an invalidation, per tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationOutcome {
    pub memory: usize,
    pub persistent: usize,
}

impl InvalidationOutcome {
    pub fn total(&self) -> usize {
        self.memory + self.persistent
    }
}

impl std::ops::AddAssign for InvalidationOutcome {
    fn add_assign(&mut self, other: Self) {
        self.memory += other.memory;
        self.persistent += other.persistent;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixCounts {
    pub memory: usize,
    pub persistent: usize,
}

/// Snapshot of cache occupancy, computed on demand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub max_memory_entries: usize,
    pub persistent_entries: usize,
    pub in_flight: usize,
    pub by_prefix: BTreeMap<String, PrefixCounts>,
}

struct Inner {
    memory: MemoryCache,
    store: Arc<dyn PersistentStore>,
    in_flight: InFlightRegistry<Value>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    events: broadcast::Sender<CacheEvent>,
}

/// Handle to the cache. Cheap to clone; all clones share the same tiers.
///
/// Build one per application (or per test) and hand it to hooks, mutations
/// and the session cleanup.
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<Inner>,
}

impl CacheManager {
    pub fn new(config: CacheConfig, store: Arc<dyn PersistentStore>) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: CacheConfig,
        store: Arc<dyn PersistentStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                memory: MemoryCache::new(config.max_memory_entries),
                store,
                in_flight: InFlightRegistry::new(),
                clock,
                config,
                events,
            }),
        }
    }

    /// Application start: sweep out entries that expired while the app was closed.
    pub async fn init(&self) -> usize {
        let removed = self.cleanup_expired().await;
        info!(removed, "Cache initialized");
        removed
    }

    /// Application stop: drop the memory tier. Persisted entries remain.
    pub fn dispose(&self) {
        let dropped = self.inner.memory.clear();
        info!(dropped, "Cache disposed");
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// Effective TTL for `resource`, after config overrides.
    pub fn ttl_for(&self, resource: &Resource) -> Duration {
        self.inner
            .config
            .ttl_overrides
            .get(&resource.kind)
            .copied()
            .unwrap_or(resource.ttl)
    }

    /// Read through both tiers, falling back to `fetcher`.
    pub async fn get<T, F, Fut>(
        &self,
        resource: &Resource,
        params: &Params,
        user_scope: Option<&str>,
        fetcher: F,
    ) -> Result<CacheResult<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.get_with(resource, params, user_scope, GetOptions::default(), fetcher)
            .await
    }

    /// Read with explicit options.
    ///
    /// - fresh memory entry: returned without I/O
    /// - stale memory entry: returned immediately, refresh started in the background
    /// - fresh persistent entry: promoted to memory and returned
    /// - otherwise: one coalesced fetch, written to both tiers
    ///
    /// A failed fetch is only an error when there is nothing cached at all;
    /// an expired persisted value is served as stale instead.
    pub async fn get_with<T, F, Fut>(
        &self,
        resource: &Resource,
        params: &Params,
        user_scope: Option<&str>,
        options: GetOptions,
        fetcher: F,
    ) -> Result<CacheResult<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let key = KeyRegistry::build_key(resource, params, user_scope)?;
        let scope = Self::entry_scope(resource, user_scope);
        let ttl_ms = duration_ms(options.ttl.unwrap_or_else(|| self.ttl_for(resource)));
        let now = self.inner.clock.now();
        let mut fallback = None;

        if !options.force_fetch {
            if let Some(entry) = self.inner.memory.get(key.as_str()) {
                match decode::<T>(key.as_str(), &entry.value) {
                    Ok(value) if entry.is_fresh(now) => {
                        debug!(key = %key, "Memory cache hit");
                        return Ok(hit(value, entry.created_at, false));
                    }
                    Ok(value) => {
                        debug!(key = %key, "Serving stale entry, revalidating in background");
                        drop(self.start_fetch(&key, ttl_ms, scope, fetcher));
                        return Ok(hit(value, entry.created_at, true));
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Dropping undecodable memory entry");
                        self.inner.memory.delete(key.as_str());
                        self.inner.remove_persisted(key.as_str()).await;
                    }
                }
            } else if let Some(entry) = self.inner.load_persisted(key.as_str()).await {
                if entry.is_fresh(now) {
                    match decode::<T>(key.as_str(), &entry.value) {
                        Ok(value) => {
                            debug!(key = %key, "Persistent cache hit, promoting to memory");
                            let created_at = entry.created_at;
                            self.inner.memory.set(key.as_str(), entry);
                            return Ok(hit(value, created_at, false));
                        }
                        Err(e) => {
                            warn!(key = %key, error = %e, "Dropping undecodable persisted entry");
                            self.inner.remove_persisted(key.as_str()).await;
                        }
                    }
                } else {
                    debug!(key = %key, "Persisted entry expired, fetching");
                    fallback = Some(entry);
                }
            }
        }

        let fetched = self.start_fetch(&key, ttl_ms, scope, fetcher).await;
        match fetched {
            Ok(value) => {
                let value = decode::<T>(key.as_str(), &value)?;
                Ok(CacheResult {
                    value,
                    from_cache: false,
                    stale: false,
                    cached_at: self.inner.clock.now(),
                })
            }
            Err(err) => match fallback {
                Some(entry) => match decode::<T>(key.as_str(), &entry.value) {
                    Ok(value) => {
                        warn!(key = %key, error = %err, "Fetch failed, serving expired entry");
                        let created_at = entry.created_at;
                        self.inner.memory.set(key.as_str(), entry);
                        Ok(hit(value, created_at, true))
                    }
                    Err(_) => Err(err),
                },
                None => Err(err),
            },
        }
    }

    /// Write-through without fetching, for optimistic updates after a mutation.
    pub async fn set<T: Serialize>(
        &self,
        resource: &Resource,
        params: &Params,
        user_scope: Option<&str>,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let key = KeyRegistry::build_key(resource, params, user_scope)?;
        let value = serde_json::to_value(value).map_err(|e| CacheError::Serialization {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        let ttl_ms = duration_ms(ttl.unwrap_or_else(|| self.ttl_for(resource)));
        let scope = Self::entry_scope(resource, user_scope);
        self.inner.write(key.as_str(), value, ttl_ms, scope, None).await;
        Ok(())
    }

    /// Memory-tier lookup by key, no I/O and no freshness check.
    pub fn peek<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
        let entry = self.inner.memory.get(key)?;
        match decode::<T>(key, &entry.value) {
            Ok(value) => Some(CacheEntry::new(
                key,
                value,
                entry.created_at,
                entry.ttl_ms,
                entry.user_scope.clone(),
            )),
            Err(e) => {
                debug!(key, error = %e, "Peeked entry does not decode");
                None
            }
        }
    }

    /// Remove every entry whose key matches `pattern` from both tiers.
    /// Matching fetches already in flight are detached and never written
    /// back, so the next `get` for those keys fetches fresh data.
    pub async fn invalidate(&self, pattern: &str) -> InvalidationOutcome {
        self.inner
            .in_flight
            .detach_where(|key| KeyRegistry::matches(key, pattern));
        let memory = self
            .inner
            .memory
            .delete_where(|key, _| KeyRegistry::matches(key, pattern));

        let persistent = match self
            .inner
            .store
            .remove_where(&|stored: &str| {
                stored
                    .strip_prefix(CACHE_PREFIX)
                    .is_some_and(|key| KeyRegistry::matches(key, pattern))
            })
            .await
        {
            Ok(removed) => removed,
            Err(e) => {
                warn!(pattern, error = %e, "Failed to invalidate persisted entries");
                0
            }
        };

        debug!(pattern, memory, persistent, "Invalidated cache entries");
        self.inner.notify(CacheEvent::Invalidated {
            pattern: pattern.to_string(),
        });
        InvalidationOutcome { memory, persistent }
    }

    /// Invalidate `kind` and everything derived from it.
    pub async fn invalidate_kind(&self, kind: ResourceKind) -> InvalidationOutcome {
        let mut outcome = InvalidationOutcome::default();
        for affected in kind.invalidation_set() {
            outcome += self.invalidate(affected.prefix()).await;
        }
        outcome
    }

    /// Remove every cache entry regardless of scope. Used on logout.
    pub async fn clear_all(&self) -> InvalidationOutcome {
        self.inner.in_flight.detach_where(|_| true);
        let memory = self.inner.memory.clear();
        let persistent = match self
            .inner
            .store
            .remove_where(&|stored: &str| stored.starts_with(CACHE_PREFIX))
            .await
        {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, "Failed to clear persisted entries");
                0
            }
        };

        info!(memory, persistent, "Cleared all cache entries");
        self.inner.notify(CacheEvent::Cleared { scope: None });
        InvalidationOutcome { memory, persistent }
    }

    /// Remove every entry owned by `scope`, from both tiers.
    pub async fn purge_scope(&self, scope: &str) -> InvalidationOutcome {
        self.inner
            .in_flight
            .detach_where(|key| KeyRegistry::scope_of(key).as_deref() == Some(scope));
        let memory = self
            .inner
            .memory
            .delete_where(|_, entry| entry.user_scope.as_deref() == Some(scope));
        let persistent = match self
            .inner
            .store
            .remove_where(&|stored: &str| {
                stored
                    .strip_prefix(CACHE_PREFIX)
                    .is_some_and(|key| KeyRegistry::scope_of(key).as_deref() == Some(scope))
            })
            .await
        {
            Ok(removed) => removed,
            Err(e) => {
                warn!(scope, error = %e, "Failed to purge persisted entries");
                0
            }
        };

        info!(scope, memory, persistent, "Purged user cache entries");
        self.inner.notify(CacheEvent::Cleared {
            scope: Some(scope.to_string()),
        });
        InvalidationOutcome { memory, persistent }
    }

    /// Remove entries past their TTL from both tiers. Maintenance only;
    /// `get` never relies on it for correctness.
    pub async fn cleanup_expired(&self) -> usize {
        let now = self.inner.clock.now();
        let mut removed = self
            .inner
            .memory
            .delete_where(|_, entry| entry.expires_at() < now);

        let keys = match self.inner.store.all_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Failed to list persisted entries for cleanup");
                return removed;
            }
        };

        for stored in keys {
            let Some(key) = stored.strip_prefix(CACHE_PREFIX) else {
                continue;
            };
            // Corrupt entries are removed by load_persisted itself
            match self.inner.load_persisted(key).await {
                Some(entry) if entry.expires_at() < now => {
                    self.inner.remove_persisted(key).await;
                    removed += 1;
                }
                Some(_) | None => {}
            }
        }

        debug!(removed, "Expired cache entries cleaned up");
        removed
    }

    /// Occupancy per tier, grouped by resource prefix.
    pub async fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            max_memory_entries: self.inner.memory.max_entries(),
            in_flight: self.inner.in_flight.pending_count(),
            ..CacheStats::default()
        };

        for key in self.inner.memory.keys() {
            stats.memory_entries += 1;
            let prefix = KeyRegistry::prefix_of(&key).to_string();
            stats.by_prefix.entry(prefix).or_default().memory += 1;
        }

        match self.inner.store.all_keys().await {
            Ok(keys) => {
                for stored in keys {
                    if let Some(key) = stored.strip_prefix(CACHE_PREFIX) {
                        stats.persistent_entries += 1;
                        let prefix = KeyRegistry::prefix_of(key).to_string();
                        stats.by_prefix.entry(prefix).or_default().persistent += 1;
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to list persisted entries for stats"),
        }

        stats
    }

    /// Entries currently held in memory, for inspection tooling.
    pub fn memory_keys(&self) -> Vec<String> {
        self.inner.memory.keys()
    }

    /// Read a persisted entry without promoting it, for inspection tooling.
    pub async fn inspect_persisted(&self, key: &str) -> Option<CacheEntry<Value>> {
        self.inner.load_persisted(key).await
    }

    pub fn is_fetching(&self, key: &CacheKey) -> bool {
        self.inner.in_flight.is_pending(key.as_str())
    }

    fn entry_scope(resource: &Resource, user_scope: Option<&str>) -> Option<String> {
        if resource.user_scoped {
            user_scope.map(str::to_string)
        } else {
            None
        }
    }

    /// Join or start the coalesced fetch for `key`. The spawned task writes
    /// the result to both tiers before releasing the key.
    fn start_fetch<T, F, Fut>(
        &self,
        key: &CacheKey,
        ttl_ms: u64,
        scope: Option<String>,
        fetcher: F,
    ) -> InFlight<Value>
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let registry_key = key.as_str();
        let key = registry_key.to_string();

        self.inner.in_flight.start(registry_key, move |superseded| async move {
            let outcome = match fetcher().await {
                Ok(fetched) => {
                    serde_json::to_value(fetched).map_err(|e| CacheError::Serialization {
                        key: key.clone(),
                        message: e.to_string(),
                    })
                }
                Err(e) => Err(CacheError::fetch(&key, &e)),
            };

            match outcome {
                Ok(value) => {
                    inner
                        .write(&key, value.clone(), ttl_ms, scope, Some(&superseded))
                        .await;
                    Ok(value)
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "Fetch failed, keeping existing entry");
                    inner.notify(CacheEvent::RefreshFailed {
                        key: key.clone(),
                        message: err.to_string(),
                    });
                    Err(err)
                }
            }
        })
    }
}

impl Inner {
    fn notify(&self, event: CacheEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Replace the entry for `key` in both tiers. A persistent failure leaves
    /// the memory entry in place. Results of a fetch that was detached by an
    /// invalidation or purge are dropped.
    async fn write(
        &self,
        key: &str,
        value: Value,
        ttl_ms: u64,
        scope: Option<String>,
        superseded: Option<&Superseded>,
    ) {
        let is_superseded = || superseded.is_some_and(Superseded::is_set);
        if is_superseded() {
            debug!(key, "Discarding superseded fetch result");
            return;
        }

        let entry = CacheEntry::new(key, value, self.clock.now(), ttl_ms, scope);
        let serialized = serde_json::to_string(&entry);
        self.memory.set(key, entry);

        match serialized {
            Ok(json) => {
                if let Err(e) = self.store.set(&persisted_key(key), json).await {
                    warn!(key, error = %e, "Failed to persist cache entry, keeping it in memory only");
                }
            }
            Err(e) => warn!(key, error = %e, "Failed to serialize cache entry for persistence"),
        }

        if is_superseded() {
            // Invalidated or purged while persisting
            self.memory.delete(key);
            self.remove_persisted(key).await;
            return;
        }

        self.notify(CacheEvent::Updated {
            key: key.to_string(),
        });
    }

    /// Load and decode a persisted entry. Unreadable stores count as a miss;
    /// corrupt entries are removed and count as a miss.
    async fn load_persisted(&self, key: &str) -> Option<CacheEntry<Value>> {
        let raw = match self.store.get(&persisted_key(key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "Failed to read persisted entry");
                return None;
            }
        };

        match serde_json::from_str::<CacheEntry<Value>>(&raw) {
            Ok(entry) if entry.key == key => Some(entry),
            Ok(entry) => {
                let err = CacheError::CorruptEntry {
                    key: key.to_string(),
                    message: format!("entry is stored under {}", entry.key),
                };
                warn!(error = %err, "Removing corrupt cache entry");
                self.remove_persisted(key).await;
                None
            }
            Err(e) => {
                let err = CacheError::CorruptEntry {
                    key: key.to_string(),
                    message: e.to_string(),
                };
                warn!(error = %err, "Removing corrupt cache entry");
                self.remove_persisted(key).await;
                None
            }
        }
    }

    async fn remove_persisted(&self, key: &str) {
        if let Err(e) = self.store.remove(&persisted_key(key)).await {
            warn!(key, error = %e, "Failed to remove persisted entry");
        }
    }
}

fn persisted_key(key: &str) -> String {
    format!("{}{}", CACHE_PREFIX, key)
}

fn duration_ms(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

fn hit<T>(value: T, cached_at: DateTime<Utc>, stale: bool) -> CacheResult<T> {
    CacheResult {
        value,
        from_cache: true,
        stale,
        cached_at,
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: &Value) -> Result<T, CacheError> {
    T::deserialize(value).map_err(|e| CacheError::CorruptEntry {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::{self, Ready};
    use tokio::sync::oneshot;

    use super::*;
    use crate::cache::resource::catalog;
    use crate::cache::store::MemoryStore;
    use crate::models::Farm;
    use crate::test_support::{farm, manager, manual_clock, memory_manager, FailingStore};

    fn counted<T: Send + 'static>(
        calls: &Arc<AtomicUsize>,
        value: T,
    ) -> impl FnOnce() -> Ready<anyhow::Result<T>> + Send + 'static {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            future::ready(Ok(value))
        }
    }

    fn offline<T: Send + 'static>() -> impl FnOnce() -> Ready<anyhow::Result<T>> + Send + 'static
    {
        || future::ready(Err(anyhow::anyhow!("network unreachable")))
    }

    async fn next_update(events: &mut broadcast::Receiver<CacheEvent>) -> String {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
                Ok(Ok(CacheEvent::Updated { key })) => return key,
                Ok(Ok(_)) => continue,
                other => panic!("expected an update event, got {:?}", other),
            }
        }
    }

    fn farms_key(user: &str) -> CacheKey {
        KeyRegistry::build_key(&catalog::USER_FARMS, &Params::new(), Some(user)).unwrap()
    }

    #[tokio::test]
    async fn test_fresh_entry_skips_fetch() {
        let (cache, _) = memory_manager(manual_clock());
        let calls = Arc::new(AtomicUsize::new(0));
        let farms = vec![farm(1, "North", "u1")];

        let first = cache
            .get(&catalog::USER_FARMS, &Params::new(), Some("u1"), counted(&calls, farms.clone()))
            .await
            .unwrap();
        assert!(!first.from_cache);

        let second: CacheResult<Vec<Farm>> = cache
            .get(&catalog::USER_FARMS, &Params::new(), Some("u1"), counted(&calls, Vec::new()))
            .await
            .unwrap();
        assert!(second.from_cache);
        assert!(!second.stale);
        assert_eq!(second.value, farms);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sixty_second_ttl_fresh_then_stale() {
        let clock = manual_clock();
        let (cache, _) = memory_manager(clock.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let options = GetOptions {
            ttl: Some(Duration::from_millis(60_000)),
            force_fetch: false,
        };
        let key = farms_key("u1");

        cache
            .get_with(
                &catalog::USER_FARMS,
                &Params::new(),
                Some("u1"),
                options,
                counted(&calls, vec![farm(1, "Old", "u1")]),
            )
            .await
            .unwrap();

        clock.advance_ms(30_000);
        let at_30s: CacheResult<Vec<Farm>> = cache
            .get_with(
                &catalog::USER_FARMS,
                &Params::new(),
                Some("u1"),
                options,
                counted(&calls, vec![farm(1, "New", "u1")]),
            )
            .await
            .unwrap();
        assert!(at_30s.from_cache);
        assert!(!at_30s.stale);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance_ms(60_000);
        let mut events = cache.subscribe();
        let at_90s: CacheResult<Vec<Farm>> = cache
            .get_with(
                &catalog::USER_FARMS,
                &Params::new(),
                Some("u1"),
                options,
                counted(&calls, vec![farm(1, "New", "u1")]),
            )
            .await
            .unwrap();
        assert!(at_90s.stale);
        assert_eq!(at_90s.value[0].name, "Old");

        assert_eq!(next_update(&mut events).await, key.as_str());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let refreshed = cache.peek::<Vec<Farm>>(key.as_str()).unwrap();
        assert_eq!(refreshed.value[0].name, "New");
        assert!(refreshed.is_fresh(clock.now()));
    }

    #[tokio::test]
    async fn test_entry_is_stale_exactly_at_ttl() {
        let clock = manual_clock();
        let (cache, _) = memory_manager(clock.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let ttl = cache.ttl_for(&catalog::USER_FARMS);

        cache
            .set(&catalog::USER_FARMS, &Params::new(), Some("u1"), &vec![farm(1, "A", "u1")], None)
            .await
            .unwrap();
        clock.advance(chrono::Duration::from_std(ttl).unwrap());

        let read: CacheResult<Vec<Farm>> = cache
            .get(&catalog::USER_FARMS, &Params::new(), Some("u1"), counted(&calls, Vec::new()))
            .await
            .unwrap();
        assert!(read.stale);
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_fetch() {
        let (cache, _) = memory_manager(manual_clock());
        let calls = Arc::new(AtomicUsize::new(0));

        let params = Params::new();
        let reads = (0..10).map(|_| {
            let calls = Arc::clone(&calls);
            cache.get(&catalog::USER_FARMS, &params, Some("u1"), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(vec![farm(1, "North", "u1")])
            })
        });
        let results: Vec<Result<CacheResult<Vec<Farm>>, CacheError>> =
            future::join_all(reads).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap().value[0].name, "North");
        }
        assert!(!cache.is_fetching(&farms_key("u1")));
    }

    #[tokio::test]
    async fn test_force_fetch_bypasses_fresh_entry() {
        let (cache, _) = memory_manager(manual_clock());
        let calls = Arc::new(AtomicUsize::new(0));

        cache
            .set(&catalog::USER_FARMS, &Params::new(), Some("u1"), &vec![farm(1, "A", "u1")], None)
            .await
            .unwrap();
        let read = cache
            .get_with(
                &catalog::USER_FARMS,
                &Params::new(),
                Some("u1"),
                GetOptions::forced(),
                counted(&calls, vec![farm(1, "B", "u1")]),
            )
            .await
            .unwrap();

        assert!(!read.from_cache);
        assert_eq!(read.value[0].name, "B");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_set_then_get_round_trips() {
        let (cache, _) = memory_manager(manual_clock());
        let calls = Arc::new(AtomicUsize::new(0));
        let params = Params::new().with("id", 7);
        let saved = farm(7, "Creek", "u1");

        cache
            .set(&catalog::FARM_BY_ID, &params, Some("u1"), &saved, None)
            .await
            .unwrap();
        let read = cache
            .get(&catalog::FARM_BY_ID, &params, Some("u1"), counted(&calls, farm(7, "X", "u1")))
            .await
            .unwrap();

        assert_eq!(read.value, saved);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_user_fails_before_fetch() {
        let (cache, _) = memory_manager(manual_clock());
        let calls = Arc::new(AtomicUsize::new(0));

        let err = cache
            .get(&catalog::USER_FARMS, &Params::new(), None, counted(&calls, Vec::<Farm>::new()))
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::KeyConstruction { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fetch_error_without_cached_value() {
        let (cache, _) = memory_manager(manual_clock());

        let err = cache
            .get::<Vec<Farm>, _, _>(&catalog::USER_FARMS, &Params::new(), Some("u1"), offline())
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::Fetch { .. }));
        assert!(err.to_string().contains("network unreachable"));
    }

    #[tokio::test]
    async fn test_invalidate_removes_matching_keys_from_both_tiers() {
        let (cache, store) = memory_manager(manual_clock());
        let by_id = Params::new().with("id", 1);
        let by_farm = Params::new().with("farm", 1);

        cache
            .set(&catalog::USER_FARMS, &Params::new(), Some("u1"), &vec![farm(1, "A", "u1")], None)
            .await
            .unwrap();
        cache
            .set(&catalog::FARM_BY_ID, &by_id, Some("u1"), &farm(1, "A", "u1"), None)
            .await
            .unwrap();
        cache
            .set(&catalog::CATTLE_BY_FARM, &by_farm, Some("u1"), &Vec::<u32>::new(), None)
            .await
            .unwrap();

        let outcome = cache.invalidate("farms").await;
        assert_eq!(outcome, InvalidationOutcome { memory: 2, persistent: 2 });

        let keys = cache.memory_keys();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].starts_with("cattle:byFarm"));
        assert_eq!(store.all_keys().await.unwrap().len(), 1);

        // Partial segment never matches
        assert_eq!(cache.invalidate("cat").await.total(), 0);
    }

    #[tokio::test]
    async fn test_farm_invalidation_cascades_to_derived_kinds() {
        let (cache, _) = memory_manager(manual_clock());
        let calls = Arc::new(AtomicUsize::new(0));

        cache
            .set(&catalog::USER_FARMS, &Params::new(), Some("u1"), &vec![farm(1, "A", "u1")], None)
            .await
            .unwrap();
        cache
            .set(&catalog::CATTLE_COUNT_BY_FARM, &Params::new(), Some("u1"), &Vec::<u32>::new(), None)
            .await
            .unwrap();
        cache
            .set(&catalog::USER_PROFILE, &Params::new(), Some("u1"), &"profile", None)
            .await
            .unwrap();

        cache.invalidate_kind(ResourceKind::Farms).await;

        let keys = cache.memory_keys();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].starts_with("users/profile"));

        let read = cache
            .get(&catalog::USER_FARMS, &Params::new(), Some("u1"), counted(&calls, vec![farm(1, "B", "u1")]))
            .await
            .unwrap();
        assert!(!read.from_cache);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_purge_scope_leaves_other_users() {
        let (cache, store) = memory_manager(manual_clock());
        for user in ["u1", "u2"] {
            cache
                .set(&catalog::USER_FARMS, &Params::new(), Some(user), &vec![farm(1, "A", user)], None)
                .await
                .unwrap();
        }

        let outcome = cache.purge_scope("u1").await;
        assert_eq!(outcome.total(), 2);

        assert!(cache.peek::<Vec<Farm>>(farms_key("u1").as_str()).is_none());
        assert!(cache.peek::<Vec<Farm>>(farms_key("u2").as_str()).is_some());
        assert_eq!(store.all_keys().await.unwrap(), vec![format!("{}{}", CACHE_PREFIX, farms_key("u2"))]);
    }

    #[tokio::test]
    async fn test_fetch_started_before_purge_is_not_written() {
        let (cache, store) = memory_manager(manual_clock());
        let (release, gate) = oneshot::channel::<()>();
        let key = farms_key("u1");

        let reader = cache.clone();
        let pending = tokio::spawn(async move {
            let params = Params::new();
            let read = reader
                .get(&catalog::USER_FARMS, &params, Some("u1"), move || async move {
                    let _ = gate.await;
                    Ok(vec![farm(1, "A", "u1")])
                })
                .await;
            read
        });
        while !cache.is_fetching(&key) {
            tokio::task::yield_now().await;
        }

        cache.purge_scope("u1").await;
        release.send(()).unwrap();

        let read = pending.await.unwrap().unwrap();
        assert_eq!(read.value.len(), 1);
        assert!(cache.peek::<Vec<Farm>>(key.as_str()).is_none());
        assert!(store.all_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_detaches_fetch_in_flight() {
        let (cache, _store) = memory_manager(manual_clock());
        let (release, gate) = oneshot::channel::<()>();
        let key = farms_key("u1");

        let reader = cache.clone();
        let before = tokio::spawn(async move {
            let params = Params::new();
            let read = reader
                .get(&catalog::USER_FARMS, &params, Some("u1"), move || async move {
                    let _ = gate.await;
                    Ok(vec![farm(1, "Before edit", "u1")])
                })
                .await;
            read
        });
        while !cache.is_fetching(&key) {
            tokio::task::yield_now().await;
        }

        cache.invalidate("farms").await;
        assert!(!cache.is_fetching(&key));

        let calls = Arc::new(AtomicUsize::new(0));
        let after = cache
            .get(
                &catalog::USER_FARMS,
                &Params::new(),
                Some("u1"),
                counted(&calls, vec![farm(1, "After edit", "u1"), farm(2, "New", "u1")]),
            )
            .await
            .unwrap();
        assert_eq!(after.value.len(), 2);
        assert!(!after.from_cache);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The older fetch still answers its own caller but never lands in the cache
        release.send(()).unwrap();
        let old = before.await.unwrap().unwrap();
        assert_eq!(old.value.len(), 1);
        let cached = cache.peek::<Vec<Farm>>(key.as_str()).unwrap();
        assert_eq!(cached.value.len(), 2);
        assert_eq!(cached.value[0].name, "After edit");
    }

    #[tokio::test]
    async fn test_clear_all_keeps_foreign_store_keys() {
        let (cache, store) = memory_manager(manual_clock());
        store.set("session:current", "{}".into()).await.unwrap();
        cache
            .set(&catalog::USER_FARMS, &Params::new(), Some("u1"), &vec![farm(1, "A", "u1")], None)
            .await
            .unwrap();

        let outcome = cache.clear_all().await;
        assert_eq!(outcome, InvalidationOutcome { memory: 1, persistent: 1 });
        assert_eq!(store.all_keys().await.unwrap(), vec!["session:current".to_string()]);
    }

    #[tokio::test]
    async fn test_persisted_entry_promoted_after_restart() {
        let clock = manual_clock();
        let store = Arc::new(MemoryStore::new());
        let first = manager(store.clone(), clock.clone());
        first
            .set(&catalog::USER_FARMS, &Params::new(), Some("u1"), &vec![farm(1, "A", "u1")], None)
            .await
            .unwrap();

        let restarted = manager(store, clock);
        let calls = Arc::new(AtomicUsize::new(0));
        let read = restarted
            .get(&catalog::USER_FARMS, &Params::new(), Some("u1"), counted(&calls, Vec::<Farm>::new()))
            .await
            .unwrap();

        assert!(read.from_cache);
        assert_eq!(read.value.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(restarted.memory_keys().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_persisted_entry_served_when_offline() {
        let clock = manual_clock();
        let store = Arc::new(MemoryStore::new());
        let first = manager(store.clone(), clock.clone());
        first
            .set(&catalog::USER_FARMS, &Params::new(), Some("u1"), &vec![farm(1, "A", "u1")], None)
            .await
            .unwrap();

        clock.advance(chrono::Duration::minutes(11));
        let restarted = manager(store, clock);
        let read: CacheResult<Vec<Farm>> = restarted
            .get(&catalog::USER_FARMS, &Params::new(), Some("u1"), offline())
            .await
            .unwrap();

        assert!(read.from_cache);
        assert!(read.stale);
        assert_eq!(read.value[0].name, "A");
    }

    #[tokio::test]
    async fn test_corrupt_persisted_entry_is_replaced() {
        let (cache, store) = memory_manager(manual_clock());
        let key = farms_key("u1");
        store
            .set(&format!("{}{}", CACHE_PREFIX, key), "{not json".into())
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let read = cache
            .get(&catalog::USER_FARMS, &Params::new(), Some("u1"), counted(&calls, vec![farm(1, "A", "u1")]))
            .await
            .unwrap();

        assert!(!read.from_cache);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let repaired = cache.inspect_persisted(key.as_str()).await.unwrap();
        assert_eq!(repaired.key, key.as_str());
    }

    #[tokio::test]
    async fn test_storage_failure_degrades_to_memory() {
        let cache = manager(Arc::new(FailingStore), manual_clock());
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let read = cache
                .get(&catalog::USER_FARMS, &Params::new(), Some("u1"), counted(&calls, vec![farm(1, "A", "u1")]))
                .await
                .unwrap();
            assert_eq!(read.value.len(), 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.invalidate("farms").await, InvalidationOutcome { memory: 1, persistent: 0 });
    }

    #[tokio::test]
    async fn test_cleanup_expired_sweeps_both_tiers() {
        let clock = manual_clock();
        let (cache, store) = memory_manager(clock.clone());
        cache
            .set(
                &catalog::USER_FARMS,
                &Params::new(),
                Some("u1"),
                &vec![farm(1, "A", "u1")],
                Some(Duration::from_secs(60)),
            )
            .await
            .unwrap();
        cache
            .set(&catalog::USER_PROFILE, &Params::new(), Some("u1"), &"profile", None)
            .await
            .unwrap();

        clock.advance(chrono::Duration::minutes(2));
        assert_eq!(cache.cleanup_expired().await, 2);

        let keys = cache.memory_keys();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].starts_with("users/profile"));
        assert_eq!(store.all_keys().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stats_group_by_prefix() {
        let (cache, _) = memory_manager(manual_clock());
        cache
            .set(&catalog::USER_FARMS, &Params::new(), Some("u1"), &vec![farm(1, "A", "u1")], None)
            .await
            .unwrap();
        cache
            .set(&catalog::FARM_BY_ID, &Params::new().with("id", 1), Some("u1"), &farm(1, "A", "u1"), None)
            .await
            .unwrap();
        cache
            .set(&catalog::USER_PROFILE, &Params::new(), Some("u1"), &"profile", None)
            .await
            .unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.memory_entries, 3);
        assert_eq!(stats.persistent_entries, 3);
        assert_eq!(stats.max_memory_entries, DEFAULT_MAX_MEMORY_ENTRIES);
        assert_eq!(stats.by_prefix["farms"], PrefixCounts { memory: 2, persistent: 2 });
        assert_eq!(stats.by_prefix["users"], PrefixCounts { memory: 1, persistent: 1 });
    }

    #[test]
    fn test_ttl_override_replaces_catalog_ttl() {
        let config = CacheConfig::new().with_ttl_override(ResourceKind::Cattle, Duration::from_secs(30));
        let cache = CacheManager::new(config, Arc::new(MemoryStore::new()));

        assert_eq!(cache.ttl_for(&catalog::CATTLE_BY_FARM), Duration::from_secs(30));
        assert_eq!(cache.ttl_for(&catalog::USER_FARMS), catalog::USER_FARMS.ttl);
    }
}
