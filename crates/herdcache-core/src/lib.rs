//! Herdcache core - the data layer shared by every farm and livestock screen.
//!
//! Screens never call the network directly. They read farms, cattle, the user
//! profile and report aggregates through [`hooks::DataHook`]s, which sit on a
//! two-tier (memory + persistent) [`cache::CacheManager`]. Mutations go through
//! [`mutations::Mutations`] so that every write invalidates the resources that
//! depend on it.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod hooks;
pub mod models;
pub mod mutations;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::{CacheConfig, CacheError, CacheManager, CacheResult};
pub use config::Config;
