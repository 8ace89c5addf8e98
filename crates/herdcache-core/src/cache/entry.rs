use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A cached value plus the metadata needed to judge its freshness and owner.
///
/// Entries are immutable once built; updating a key means replacing the whole entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub key: String,
    pub value: T,
    pub created_at: DateTime<Utc>,
    pub ttl_ms: u64,
    /// Owning user, or `None` for entries shared by every session.
    pub user_scope: Option<String>,
}

impl<T> CacheEntry<T> {
    pub fn new(
        key: impl Into<String>,
        value: T,
        created_at: DateTime<Utc>,
        ttl_ms: u64,
        user_scope: Option<String>,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            created_at,
            ttl_ms,
            user_scope,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    fn ttl(&self) -> Duration {
        Duration::milliseconds(i64::try_from(self.ttl_ms).unwrap_or(i64::MAX))
    }

    /// Fresh while strictly younger than the TTL.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.age(now) < self.ttl()
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        !self.is_fresh(now)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at
            .checked_add_signed(self.ttl())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn age_display(&self, now: DateTime<Utc>) -> String {
        let minutes = self.age(now).num_minutes();
        if minutes < 1 {
            // Also covers clock skew (negative ages)
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }
}
