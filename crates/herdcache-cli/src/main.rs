//! herdcache - inspect and exercise the farm data cache from a terminal.
//!
//! Reads go through the same hooks the app screens use, so a second run
//! within a resource's TTL is served from the on-disk cache.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use herdcache_core::api::ApiClient;
use herdcache_core::auth::{Session, SessionData};
use herdcache_core::cache::{
    CacheCleanup, CacheManager, FileStore, KeyRegistry, PersistentStore, ResourceKind,
    CACHE_PREFIX,
};
use herdcache_core::hooks::{DataContext, DataHook, HookState, HookStatus};
use herdcache_core::Config;

// ============================================================================
// Constants
// ============================================================================

/// Overrides the saved session token
const TOKEN_ENV: &str = "HERDCACHE_TOKEN";

/// When set, logs are also written to a file in this directory
const LOG_DIR_ENV: &str = "HERDCACHE_LOG_DIR";

const LOG_FILE: &str = "herdcache.log";

/// How long to wait for a background revalidation after printing stale data
const REVALIDATE_WAIT: Duration = Duration::from_secs(10);

const USAGE: &str = "\
Usage: herdcache <command> [args]

Cache:
  stats                    Entry counts per tier and resource
  keys                     Stored keys grouped by resource, with age
  cleanup                  Remove expired entries
  clear                    Remove every cached entry
  invalidate <kind|prefix> Invalidate a resource kind (with dependents) or key prefix

Session:
  login <user-id> <token>  Sign in, purging the previous user's cache
  logout                   Sign out and purge the cache

Data:
  farms                    Farms of the signed-in user
  cattle [farm-id]         All cattle, or one farm's herd
  profile                  The signed-in user's profile
  report                   Herd summary";

/// Initialize the tracing subscriber for logging.
/// The returned guard flushes the file writer on drop.
fn init_tracing() -> Option<WorkerGuard> {
    // RUST_LOG controls the level (e.g. RUST_LOG=herdcache_core=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let log_dir = std::env::var(LOG_DIR_ENV).ok().filter(|dir| !dir.is_empty());

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{}", USAGE);
        return Ok(());
    };
    if matches!(command, "-h" | "--help" | "help") {
        println!("{}", USAGE);
        return Ok(());
    }

    let mut cli = Cli::open(Config::load()?).await?;
    info!(command, "herdcache starting");

    let result = match (command, &args[1..]) {
        ("stats", []) => cli.stats().await,
        ("keys", []) => cli.keys().await,
        ("cleanup", []) => cli.cleanup().await,
        ("clear", []) => cli.clear().await,
        ("invalidate", [target]) => cli.invalidate(target).await,
        ("login", [user_id, token]) => cli.login(user_id, token).await,
        ("logout", []) => cli.logout().await,
        ("farms", []) => show(cli.data()?.use_user_farms()?).await,
        ("cattle", []) => show(cli.data()?.use_all_cattle_with_farm_info()?).await,
        ("cattle", [farm_id]) => {
            let farm_id: i64 = farm_id
                .parse()
                .with_context(|| format!("Invalid farm id '{}'", farm_id))?;
            show(cli.data()?.use_farm_cattle(farm_id)?).await
        }
        ("profile", []) => show(cli.data()?.use_user_profile()?).await,
        ("report", []) => show(cli.data()?.use_report_summary()?).await,
        _ => {
            eprintln!("{}", USAGE);
            bail!("Unknown command or wrong arguments: {}", args.join(" "))
        }
    };

    cli.cache.dispose();
    result
}

struct Cli {
    config: Config,
    cache: CacheManager,
    store: Arc<dyn PersistentStore>,
    session: Session,
}

impl Cli {
    async fn open(config: Config) -> Result<Self> {
        let dir = config.cache_dir()?;
        let store: Arc<dyn PersistentStore> = Arc::new(
            FileStore::new(dir.clone())
                .with_context(|| format!("Failed to open cache at {}", dir.display()))?,
        );

        let cache = CacheManager::new(config.cache_config(), Arc::clone(&store));
        cache.init().await;

        let mut session = Session::new(Arc::clone(&store));
        if let Err(e) = session.load().await {
            warn!(error = %e, "Ignoring unreadable session");
        }

        Ok(Self {
            config,
            cache,
            store,
            session,
        })
    }

    /// Hooks bound to the signed-in user and the configured backend.
    fn data(&self) -> Result<DataContext> {
        let user_id = self
            .session
            .user_id()
            .context("Not signed in. Run `herdcache login <user-id> <token>` first.")?;

        let mut client = ApiClient::new(&self.config.api_base_url())?;
        let token = std::env::var(TOKEN_ENV)
            .ok()
            .filter(|t| !t.is_empty())
            .or_else(|| self.session.token().map(str::to_string));
        if let Some(token) = token {
            client.set_token(token);
        }

        Ok(DataContext::new(
            self.cache.clone(),
            Arc::new(client),
            Some(user_id.to_string()),
        ))
    }

    async fn stats(&self) -> Result<()> {
        let stats = self.cache.stats().await;
        println!(
            "Memory:     {} / {} entries",
            stats.memory_entries, stats.max_memory_entries
        );
        println!("Persistent: {} entries", stats.persistent_entries);
        for (prefix, counts) in &stats.by_prefix {
            println!(
                "  {:<10} memory {:>4}  persistent {:>4}",
                prefix, counts.memory, counts.persistent
            );
        }
        Ok(())
    }

    async fn keys(&self) -> Result<()> {
        let stored = self
            .store
            .all_keys()
            .await
            .context("Failed to list stored keys")?;
        let now = self.cache.clock().now();

        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for stored_key in stored {
            let Some(key) = stored_key.strip_prefix(CACHE_PREFIX) else {
                groups.entry("(session)".to_string()).or_default().push(stored_key);
                continue;
            };
            let line = match self.cache.inspect_persisted(key).await {
                Some(entry) if entry.is_fresh(now) => {
                    format!("{}  {}", key, entry.age_display(now))
                }
                Some(entry) => format!("{}  {}  (stale)", key, entry.age_display(now)),
                None => format!("{}  (unreadable)", key),
            };
            groups
                .entry(KeyRegistry::prefix_of(key).to_string())
                .or_default()
                .push(line);
        }

        if groups.is_empty() {
            println!("Cache is empty");
        }
        for (group, lines) in groups {
            println!("{} ({})", group, lines.len());
            for line in lines {
                println!("  {}", line);
            }
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        let removed = self.cache.cleanup_expired().await;
        println!("Removed {} expired entries", removed);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let outcome = self.cache.clear_all().await;
        println!(
            "Cleared {} memory and {} persisted entries",
            outcome.memory, outcome.persistent
        );
        Ok(())
    }

    async fn invalidate(&self, target: &str) -> Result<()> {
        let outcome = match ResourceKind::from_prefix(target) {
            Some(kind) => self.cache.invalidate_kind(kind).await,
            None => self.cache.invalidate(target).await,
        };
        println!("Invalidated {} entries", outcome.total());
        Ok(())
    }

    async fn login(&mut self, user_id: &str, token: &str) -> Result<()> {
        let cleanup = CacheCleanup::new(self.cache.clone());
        self.session
            .switch_user(Some(SessionData::new(user_id, token)), &cleanup)
            .await?;

        self.config.last_user_id = Some(user_id.to_string());
        self.config.save()?;
        println!("Signed in as {}", user_id);
        Ok(())
    }

    async fn logout(&mut self) -> Result<()> {
        let Some(user_id) = self.session.user_id().map(str::to_string) else {
            println!("Not signed in");
            return Ok(());
        };
        let cleanup = CacheCleanup::new(self.cache.clone());
        self.session.switch_user(None, &cleanup).await?;
        println!("Signed out {}", user_id);
        Ok(())
    }
}

/// Mount `hook` and print its data. Stale data is printed right away, then
/// again once the background revalidation lands.
async fn show<T>(hook: DataHook<T>) -> Result<()>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    let mut updates = hook.subscribe();
    let mut state = hook.mount().await;

    if state.status == HookStatus::ReadyStale {
        if let Some(cached_at) = state.cached_at {
            eprintln!("Cached at {}, revalidating...", cached_at.to_rfc3339());
        }
        print_json(&state.data)?;

        let settled = tokio::time::timeout(REVALIDATE_WAIT, async {
            while updates.changed().await.is_ok() {
                let current = updates.borrow_and_update().clone();
                if current.status != HookStatus::ReadyStale {
                    return Some(current);
                }
            }
            None
        })
        .await;

        match settled {
            Ok(Some(next)) => state = next,
            _ => {
                warn!(key = %hook.key(), "Revalidation did not finish, cached data shown");
                return Ok(());
            }
        }
    }

    let HookState { data, error, .. } = state;
    if let Some(error) = error {
        if data.is_none() {
            bail!(error);
        }
        eprintln!("Refresh failed ({}), showing cached data", error);
    }
    print_json(&data)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
