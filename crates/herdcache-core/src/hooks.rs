//! Data hooks: the contract screens use to read cached resources.
//!
//! A [`DataHook`] binds one resource + parameters + user to the cache and
//! publishes a [`HookState`] (`data`, `loading`, `error`) on a watch channel.
//!
//! State machine:
//! - `mount()` reads through the cache. A fresh result lands in `Ready`; a
//!   stale one lands in `ReadyStale` with data shown immediately while the
//!   cache revalidates. When that refresh completes the hook moves to `Ready`
//!   with the new data, without ever setting `loading`.
//! - `refresh()` bypasses the cache (`Refreshing`, `loading = true`).
//! - Any failed fetch moves to `Error` and keeps the previous data.
//! - `on_focus()` refreshes only if the focus cooldown has elapsed since the
//!   hook's last load.
//! - After `unmount()` the hook never changes state again; fetches already
//!   running still complete and populate the cache.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::api::FarmApi;
use crate::cache::{
    catalog, CacheError, CacheEvent, CacheKey, CacheManager, CacheResult, GetOptions, KeyRegistry,
    Params, Resource,
};
use crate::models::{
    Cattle, CattleWithFarmInfo, Farm, FarmCattleCount, MedicalRecord, ReportSummary, UserProfile,
};

/// Fetch function for one resource: `(params, user) -> value`.
pub type FetchFn<T> =
    Arc<dyn Fn(Params, Option<String>) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStatus {
    Idle,
    Loading,
    Ready,
    /// Showing cached data past its TTL while the cache revalidates.
    ReadyStale,
    Refreshing,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HookState<T> {
    pub data: Option<T>,
    pub loading: bool,
    pub error: Option<String>,
    pub status: HookStatus,
    pub cached_at: Option<DateTime<Utc>>,
}

impl<T> Default for HookState<T> {
    fn default() -> Self {
        Self {
            data: None,
            loading: false,
            error: None,
            status: HookStatus::Idle,
            cached_at: None,
        }
    }
}

struct HookShared<T> {
    cache: CacheManager,
    resource: Resource,
    params: Params,
    user_scope: Option<String>,
    key: CacheKey,
    fetcher: FetchFn<T>,
    state: watch::Sender<HookState<T>>,
    mounted: AtomicBool,
    last_load: Mutex<Option<DateTime<Utc>>>,
    /// Background refresh failure seen before the stale result was published.
    refresh_error: Mutex<Option<String>>,
}

pub struct DataHook<T> {
    shared: Arc<HookShared<T>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl<T> DataHook<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Bind a hook. Fails immediately if the key cannot be built.
    pub fn new(
        cache: CacheManager,
        resource: Resource,
        params: Params,
        user_scope: Option<String>,
        fetcher: FetchFn<T>,
    ) -> Result<Self, CacheError> {
        let key = KeyRegistry::build_key(&resource, &params, user_scope.as_deref())?;
        let (state, _) = watch::channel(HookState::default());
        Ok(Self {
            shared: Arc::new(HookShared {
                cache,
                resource,
                params,
                user_scope,
                key,
                fetcher,
                state,
                mounted: AtomicBool::new(false),
                last_load: Mutex::new(None),
                refresh_error: Mutex::new(None),
            }),
            listener: Mutex::new(None),
        })
    }

    pub fn key(&self) -> &CacheKey {
        &self.shared.key
    }

    pub fn state(&self) -> HookState<T> {
        self.shared.state.borrow().clone()
    }

    /// Observe every state transition.
    pub fn subscribe(&self) -> watch::Receiver<HookState<T>> {
        self.shared.state.subscribe()
    }

    pub fn is_mounted(&self) -> bool {
        self.shared.mounted.load(Ordering::SeqCst)
    }

    /// Initial read through the cache.
    pub async fn mount(&self) -> HookState<T> {
        self.shared.mounted.store(true, Ordering::SeqCst);

        // Subscribe before reading so a background refresh cannot slip past
        let events = self.shared.cache.subscribe();
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move { shared.listen(events).await });
        if let Some(previous) = self.listener.lock().replace(handle) {
            previous.abort();
        }

        self.shared.update(|state| {
            state.loading = true;
            state.status = HookStatus::Loading;
        });
        *self.shared.last_load.lock() = Some(self.shared.cache.clock().now());
        self.shared.load(GetOptions::default()).await;
        self.state()
    }

    /// Bypass the cache and fetch again.
    pub async fn refresh(&self) -> HookState<T> {
        if !self.is_mounted() {
            debug!(key = %self.shared.key, "Ignoring refresh on unmounted hook");
            return self.state();
        }
        *self.shared.last_load.lock() = Some(self.shared.cache.clock().now());
        self.shared.refresh().await;
        self.state()
    }

    /// Screen gained focus: refresh unless the hook loaded within the cooldown.
    /// Returns whether a refresh ran.
    pub async fn on_focus(&self) -> bool {
        if !self.is_mounted() {
            return false;
        }

        let cooldown = Duration::from_std(self.shared.cache.config().focus_cooldown)
            .unwrap_or_else(|_| Duration::zero());
        let now = self.shared.cache.clock().now();
        {
            let mut last_load = self.shared.last_load.lock();
            if let Some(last) = *last_load {
                if now - last < cooldown {
                    debug!(key = %self.shared.key, "Focus refresh skipped, within cooldown");
                    return false;
                }
            }
            *last_load = Some(now);
        }

        self.shared.refresh().await;
        true
    }

    /// Stop publishing state. Running fetches are left to finish.
    pub fn unmount(&self) {
        self.shared.mounted.store(false, Ordering::SeqCst);
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }
}

impl<T> Drop for DataHook<T> {
    fn drop(&mut self) {
        self.shared.mounted.store(false, Ordering::SeqCst);
        if let Some(handle) = self.listener.get_mut().take() {
            handle.abort();
        }
    }
}

impl<T> HookShared<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn update(&self, f: impl FnOnce(&mut HookState<T>)) {
        if self.mounted.load(Ordering::SeqCst) {
            self.state.send_modify(f);
        }
    }

    async fn refresh(&self) {
        self.update(|state| {
            state.loading = true;
            state.status = HookStatus::Refreshing;
        });
        self.load(GetOptions::forced()).await;
    }

    async fn load(&self, options: GetOptions) {
        let fetcher = Arc::clone(&self.fetcher);
        let params = self.params.clone();
        let user = self.user_scope.clone();
        self.refresh_error.lock().take();

        let result = self
            .cache
            .get_with(
                &self.resource,
                &self.params,
                self.user_scope.as_deref(),
                options,
                move || fetcher(params, user),
            )
            .await;

        match result {
            Ok(read) => self.apply_read(read),
            Err(e) => {
                debug!(key = %self.key, error = %e, "Hook load failed");
                self.update(|state| {
                    state.loading = false;
                    state.error = Some(e.to_string());
                    state.status = HookStatus::Error;
                });
            }
        }
    }

    /// Publish a successful read. The background refresh it started may
    /// already have settled either way.
    fn apply_read(&self, read: CacheResult<T>) {
        let newer = if read.stale {
            self.cache
                .peek::<T>(self.key.as_str())
                .filter(|entry| entry.created_at > read.cached_at)
        } else {
            None
        };

        self.update(|state| {
            state.loading = false;
            state.error = None;
            match newer {
                Some(entry) => {
                    state.data = Some(entry.value);
                    state.cached_at = Some(entry.created_at);
                    state.status = HookStatus::Ready;
                }
                None => {
                    state.data = Some(read.value);
                    state.cached_at = Some(read.cached_at);
                    state.status = HookStatus::Ready;
                    if read.stale {
                        state.status = match self.refresh_error.lock().take() {
                            Some(message) => {
                                state.error = Some(message);
                                HookStatus::Error
                            }
                            None => HookStatus::ReadyStale,
                        };
                    }
                }
            }
        });
    }

    fn apply_event(&self, event: CacheEvent) {
        match event {
            CacheEvent::Updated { key } if key == self.key.as_str() => {
                if self.state.borrow().status == HookStatus::Refreshing {
                    return;
                }
                if let Some(entry) = self.cache.peek::<T>(&key) {
                    self.update(|state| {
                        state.data = Some(entry.value);
                        state.error = None;
                        state.cached_at = Some(entry.created_at);
                        state.status = HookStatus::Ready;
                    });
                }
            }
            CacheEvent::RefreshFailed { key, message } if key == self.key.as_str() => {
                // Checked under the state lock so a racing stale publish sees one or the other
                self.update(|state| {
                    if state.status == HookStatus::ReadyStale {
                        state.error = Some(message);
                        state.status = HookStatus::Error;
                    } else {
                        *self.refresh_error.lock() = Some(message);
                    }
                });
            }
            _ => {}
        }
    }

    /// Apply background revalidation results for this hook's key.
    async fn listen(self: Arc<Self>, mut events: broadcast::Receiver<CacheEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.apply_event(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(key = %self.key, skipped, "Hook listener lagged behind cache events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

// ============================================================================
// Typed hooks
// ============================================================================

/// Builds the hooks screens use, bound to one backend and the signed-in user.
#[derive(Clone)]
pub struct DataContext {
    cache: CacheManager,
    api: Arc<dyn FarmApi>,
    user_id: Option<String>,
}

impl DataContext {
    pub fn new(cache: CacheManager, api: Arc<dyn FarmApi>, user_id: Option<String>) -> Self {
        Self { cache, api, user_id }
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    fn hook<T, F, Fut>(
        &self,
        resource: Resource,
        params: Params,
        fetch: F,
    ) -> Result<DataHook<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        F: Fn(Arc<dyn FarmApi>, Params, Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let api = Arc::clone(&self.api);
        let fetcher: FetchFn<T> =
            Arc::new(move |params, user| fetch(Arc::clone(&api), params, user).boxed());
        DataHook::new(
            self.cache.clone(),
            resource,
            params,
            self.user_id.clone(),
            fetcher,
        )
    }

    pub fn use_user_farms(&self) -> Result<DataHook<Vec<Farm>>, CacheError> {
        self.hook(catalog::USER_FARMS, Params::new(), |api, _, user| async move {
            api.list_farms(&signed_in(user)?).await
        })
    }

    pub fn use_farm(&self, farm_id: i64) -> Result<DataHook<Farm>, CacheError> {
        let params = Params::new().with("id", farm_id);
        self.hook(catalog::FARM_BY_ID, params, |api, params, _| async move {
            api.fetch_farm(param_i64(&params, "id")?).await
        })
    }

    pub fn use_all_cattle_with_farm_info(
        &self,
    ) -> Result<DataHook<Vec<CattleWithFarmInfo>>, CacheError> {
        self.hook(
            catalog::ALL_CATTLE_WITH_FARM_INFO,
            Params::new(),
            |api, _, user| async move { api.list_cattle_with_farm_info(&signed_in(user)?).await },
        )
    }

    pub fn use_farm_cattle(&self, farm_id: i64) -> Result<DataHook<Vec<Cattle>>, CacheError> {
        let params = Params::new().with("farm", farm_id);
        self.hook(catalog::CATTLE_BY_FARM, params, |api, params, _| async move {
            api.list_cattle_by_farm(param_i64(&params, "farm")?).await
        })
    }

    pub fn use_cattle_count_by_farm(&self) -> Result<DataHook<Vec<FarmCattleCount>>, CacheError> {
        self.hook(
            catalog::CATTLE_COUNT_BY_FARM,
            Params::new(),
            |api, _, user| async move { api.cattle_count_by_farm(&signed_in(user)?).await },
        )
    }

    pub fn use_user_profile(&self) -> Result<DataHook<UserProfile>, CacheError> {
        self.hook(catalog::USER_PROFILE, Params::new(), |api, _, user| async move {
            api.fetch_profile(&signed_in(user)?).await
        })
    }

    pub fn use_medical_records(
        &self,
        cattle_id: i64,
    ) -> Result<DataHook<Vec<MedicalRecord>>, CacheError> {
        let params = Params::new().with("cow", cattle_id);
        self.hook(catalog::MEDICAL_BY_COW, params, |api, params, _| async move {
            api.list_medical_records(param_i64(&params, "cow")?).await
        })
    }

    pub fn use_report_summary(&self) -> Result<DataHook<ReportSummary>, CacheError> {
        self.hook(catalog::REPORT_SUMMARY, Params::new(), |api, _, user| async move {
            api.fetch_report_summary(&signed_in(user)?).await
        })
    }
}

fn signed_in(user: Option<String>) -> anyhow::Result<String> {
    user.context("No signed-in user")
}

fn param_i64(params: &Params, name: &str) -> anyhow::Result<i64> {
    params
        .get_i64(name)
        .with_context(|| format!("Parameter '{}' is not an integer", name))
}
