use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::{CacheCleanup, PersistentStore};

/// Store key for the current session. Lives beside, not inside, the cache
/// namespace so clearing the cache never signs the user out.
pub const SESSION_KEY: &str = "session:current";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub user_id: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
}

impl SessionData {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
            created_at: Utc::now(),
        }
    }
}

pub struct Session {
    store: Arc<dyn PersistentStore>,
    pub data: Option<SessionData>,
}

impl Session {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self { store, data: None }
    }

    /// Load the saved session, if any.
    pub async fn load(&mut self) -> Result<bool> {
        let raw = self
            .store
            .get(SESSION_KEY)
            .await
            .context("Failed to read session")?;
        match raw {
            Some(contents) => {
                let data: SessionData =
                    serde_json::from_str(&contents).context("Failed to parse session")?;
                self.data = Some(data);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn save(&self) -> Result<()> {
        match self.data {
            Some(ref data) => {
                let contents = serde_json::to_string_pretty(data)?;
                self.store
                    .set(SESSION_KEY, contents)
                    .await
                    .context("Failed to save session")?;
            }
            None => {
                self.store
                    .remove(SESSION_KEY)
                    .await
                    .context("Failed to remove session")?;
            }
        }
        Ok(())
    }

    /// Switch to `next` (or sign out with `None`). The previous user's cache
    /// is purged before the new session is recorded, so nothing fetched
    /// afterwards can be served from the old account.
    pub async fn switch_user(
        &mut self,
        next: Option<SessionData>,
        cleanup: &CacheCleanup,
    ) -> Result<()> {
        let previous = self.user_id().map(str::to_string);
        let new_user = next.as_ref().map(|d| d.user_id.as_str());
        let purged = cleanup.on_user_changed(previous.as_deref(), new_user).await;
        info!(
            previous = ?previous,
            new = ?new_user,
            purged = purged.total(),
            "Session user changed"
        );
        self.data = next;
        self.save().await
    }

    pub fn token(&self) -> Option<&str> {
        self.data.as_ref().map(|d| d.token.as_str())
    }

    pub fn user_id(&self) -> Option<&str> {
        self.data.as_ref().map(|d| d.user_id.as_str())
    }

    pub fn is_signed_in(&self) -> bool {
        self.data.is_some()
    }
}
