use tracing::{debug, info};

use super::manager::{CacheManager, InvalidationOutcome};

/// Session-boundary sweep. The auth layer calls [`CacheCleanup::on_user_changed`]
/// on every login, logout and account switch, before the new session's first
/// fetch, so one account's farms and cattle never show up under another.
#[derive(Clone)]
pub struct CacheCleanup {
    cache: CacheManager,
}

impl CacheCleanup {
    pub fn new(cache: CacheManager) -> Self {
        Self { cache }
    }

    /// Purge entries owned by `previous`, or everything when the previous
    /// user is unknown. Re-authenticating as the same user keeps the cache.
    pub async fn on_user_changed(
        &self,
        previous: Option<&str>,
        new: Option<&str>,
    ) -> InvalidationOutcome {
        match previous {
            Some(prev) if Some(prev) == new => {
                debug!(user = prev, "Same user signed in again, keeping cache");
                InvalidationOutcome::default()
            }
            Some(prev) => {
                info!(previous = prev, new = ?new, "User changed, purging previous user's cache");
                self.cache.purge_scope(prev).await
            }
            None => {
                info!(new = ?new, "Previous user unknown, clearing entire cache");
                self.cache.clear_all().await
            }
        }
    }
}
