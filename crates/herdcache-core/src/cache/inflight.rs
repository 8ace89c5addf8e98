use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::debug;

use super::error::CacheError;

/// A fetch that any number of callers can await; all of them see the same result.
pub type InFlight<T> = Shared<BoxFuture<'static, Result<T, CacheError>>>;

/// Set once a fetch has been detached from its key. The fetch still runs and
/// its waiters still get the result, but it must not be written back.
#[derive(Debug, Clone, Default)]
pub struct Superseded(Arc<AtomicBool>);

impl Superseded {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct Pending<T> {
    id: u64,
    fetch: InFlight<T>,
    superseded: Superseded,
}

type PendingMap<T> = Arc<Mutex<HashMap<String, Pending<T>>>>;

/// Tracks outstanding fetches per key so concurrent callers share one network call.
///
/// Each fetch runs on its own spawned task: callers that stop waiting (an
/// unmounted screen) do not cancel it, and the result still lands in the cache.
/// The key is released when the task settles, whatever the outcome, unless a
/// newer fetch has taken the key over in the meantime.
pub struct InFlightRegistry<T> {
    pending: PendingMap<T>,
    next_id: AtomicU64,
}

impl<T> Default for InFlightRegistry<T> {
    fn default() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }
}

/// Releases the key when the fetch task finishes, including on panic.
struct Settle<T> {
    pending: PendingMap<T>,
    key: String,
    id: u64,
}

impl<T> Drop for Settle<T> {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        if pending.get(&self.key).is_some_and(|p| p.id == self.id) {
            pending.remove(&self.key);
        }
    }
}

impl<T> InFlightRegistry<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Await the outstanding fetch for `key`, starting one with `factory` if
    /// none is running.
    pub async fn coalesce<F, Fut>(&self, key: &str, factory: F) -> Result<T, CacheError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, CacheError>> + Send + 'static,
    {
        let fetch = self.start(key, |_| factory());
        fetch.await
    }

    /// Join or start the fetch for `key` without waiting for it. A new fetch
    /// gets the flag that tells it whether it was detached before finishing.
    pub fn start<F, Fut>(&self, key: &str, factory: F) -> InFlight<T>
    where
        F: FnOnce(Superseded) -> Fut,
        Fut: Future<Output = Result<T, CacheError>> + Send + 'static,
    {
        // Held across spawn + insert so the task cannot settle before it is registered
        let mut pending = self.pending.lock();
        if let Some(existing) = pending.get(key) {
            debug!(key, "Joining in-flight fetch");
            return existing.fetch.clone();
        }

        debug!(key, "Starting fetch");
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let superseded = Superseded::default();
        let settle = Settle {
            pending: Arc::clone(&self.pending),
            key: key.to_string(),
            id,
        };
        let fut = factory(superseded.clone());
        let handle = tokio::spawn(async move {
            let _settle = settle;
            fut.await
        });

        let task_key = key.to_string();
        let shared = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(CacheError::Fetch {
                    key: task_key,
                    message: format!("fetch task failed: {}", e),
                }),
            }
        }
        .boxed()
        .shared();

        pending.insert(
            key.to_string(),
            Pending {
                id,
                fetch: shared.clone(),
                superseded,
            },
        );
        shared
    }

    /// Detach every outstanding fetch whose key matches `predicate` and mark
    /// it superseded. The next caller for that key starts a new fetch.
    pub fn detach_where(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|key, entry| {
            if predicate(key) {
                entry.superseded.set();
                false
            } else {
                true
            }
        });
        let detached = before - pending.len();
        if detached > 0 {
            debug!(detached, "Detached in-flight fetches");
        }
        detached
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.lock().contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_fetch(
        calls: &Arc<AtomicUsize>,
        result: Result<u32, CacheError>,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<u32, CacheError>> {
        let calls = Arc::clone(calls);
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                result
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let registry = InFlightRegistry::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b, c) = tokio::join!(
            registry.coalesce("farms", counting_fetch(&calls, Ok(7))),
            registry.coalesce("farms", counting_fetch(&calls, Ok(8))),
            registry.coalesce("farms", counting_fetch(&calls, Ok(9))),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (7, 7, 7));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_fetch_independently() {
        let registry = InFlightRegistry::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            registry.coalesce("farms", counting_fetch(&calls, Ok(1))),
            registry.coalesce("cattle", counting_fetch(&calls, Ok(2))),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!((a.unwrap(), b.unwrap()), (1, 2));
    }

    #[tokio::test]
    async fn test_failure_is_shared_then_released() {
        let registry = InFlightRegistry::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let failure = CacheError::Fetch {
            key: "farms".into(),
            message: "offline".into(),
        };

        let (a, b) = tokio::join!(
            registry.coalesce("farms", counting_fetch(&calls, Err(failure.clone()))),
            registry.coalesce("farms", counting_fetch(&calls, Ok(1))),
        );
        assert_eq!(a.unwrap_err(), failure);
        assert_eq!(b.unwrap_err(), failure);
        assert!(!registry.is_pending("farms"));

        // Next call starts a fresh fetch
        let c = registry.coalesce("farms", counting_fetch(&calls, Ok(3))).await;
        assert_eq!(c.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_survives_dropped_waiter() {
        let registry = InFlightRegistry::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = counting_fetch(&calls, Ok(5));
        drop(registry.start("farms", |_| fetch()));
        assert!(registry.is_pending("farms"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!registry.is_pending("farms"));
    }

    #[tokio::test]
    async fn test_detached_fetch_is_replaced_not_released() {
        let registry = InFlightRegistry::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = counting_fetch(&calls, Ok(1));
        let mut old_flag = None;
        let old = registry.start("farms:list", |superseded| {
            old_flag = Some(superseded);
            first()
        });
        assert_eq!(registry.detach_where(|key| key.starts_with("farms")), 1);
        assert!(old_flag.unwrap().is_set());
        assert!(!registry.is_pending("farms:list"));

        let second = counting_fetch(&calls, Ok(2));
        let new = registry.start("farms:list", |superseded| {
            assert!(!superseded.is_set());
            second()
        });

        // Old waiters still get their result; the old task must not release the new key
        assert_eq!(old.await.unwrap(), 1);
        assert!(registry.is_pending("farms:list"));
        assert_eq!(new.await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::task::yield_now().await;
        assert!(!registry.is_pending("farms:list"));
    }

    #[test]
    fn test_detach_on_empty_registry() {
        let registry = InFlightRegistry::<u32>::new();
        assert_eq!(registry.detach_where(|_| true), 0);
    }
}
