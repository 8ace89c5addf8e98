//! Application configuration management.
//!
//! Holds the backend URL, cache sizing, focus cooldown, per-kind TTL
//! overrides and the last signed-in user.
//!
//! Configuration is stored at `~/.config/herdcache/config.json`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheConfig, ResourceKind};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "herdcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Backend used when neither config nor environment names one
const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api";

/// Environment override for the backend URL
pub const API_URL_ENV: &str = "HERDCACHE_API_URL";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub api_base_url: Option<String>,
    pub max_memory_entries: Option<usize>,
    pub focus_cooldown_ms: Option<u64>,
    /// TTL in seconds per resource kind, replacing the catalog defaults.
    #[serde(default)]
    pub ttl_overrides_secs: BTreeMap<ResourceKind, u64>,
    pub last_user_id: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Backend URL: environment first, then config, then the local default.
    pub fn api_base_url(&self) -> String {
        std::env::var(API_URL_ENV)
            .ok()
            .filter(|url| !url.is_empty())
            .or_else(|| self.api_base_url.clone())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
    }

    pub fn cache_config(&self) -> CacheConfig {
        let mut config = CacheConfig::default();
        if let Some(max) = self.max_memory_entries {
            config = config.with_max_entries(max);
        }
        if let Some(ms) = self.focus_cooldown_ms {
            config = config.with_focus_cooldown(Duration::from_millis(ms));
        }
        for (kind, secs) in &self.ttl_overrides_secs {
            config = config.with_ttl_override(*kind, Duration::from_secs(*secs));
        }
        config
    }
}
