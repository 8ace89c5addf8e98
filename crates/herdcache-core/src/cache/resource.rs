//! Resource kinds, their invalidation dependencies, and the resource catalog.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level families of cached data. Each kind owns one key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Farms,
    Cattle,
    Users,
    Medical,
    Reports,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Farms,
        ResourceKind::Cattle,
        ResourceKind::Users,
        ResourceKind::Medical,
        ResourceKind::Reports,
    ];

    /// Key prefix, also the string invalidation pattern for this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            ResourceKind::Farms => "farms",
            ResourceKind::Cattle => "cattle",
            ResourceKind::Users => "users",
            ResourceKind::Medical => "medical",
            ResourceKind::Reports => "reports",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.prefix() == prefix)
    }

    /// Kinds whose cached data is derived from this one and must be
    /// invalidated alongside it.
    pub fn dependents(&self) -> &'static [ResourceKind] {
        match self {
            // Per-farm cattle counts come from cattle-by-farm queries
            ResourceKind::Farms => &[ResourceKind::Cattle, ResourceKind::Reports],
            ResourceKind::Cattle => &[ResourceKind::Reports],
            ResourceKind::Medical => &[ResourceKind::Reports],
            ResourceKind::Users => &[],
            ResourceKind::Reports => &[],
        }
    }

    /// This kind plus the transitive closure of its dependents.
    pub fn invalidation_set(&self) -> BTreeSet<ResourceKind> {
        let mut seen = BTreeSet::new();
        let mut pending = vec![*self];
        while let Some(kind) = pending.pop() {
            if seen.insert(kind) {
                pending.extend_from_slice(kind.dependents());
            }
        }
        seen
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// One cacheable query: a path under its kind's prefix, the parameters it
/// cannot be built without, its default TTL, and whether it is per-user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resource {
    pub kind: ResourceKind,
    pub path: &'static str,
    pub required: &'static [&'static str],
    pub ttl: Duration,
    pub user_scoped: bool,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path)
    }
}

/// The resources read by the farm client's screens.
pub mod catalog {
    use super::{Resource, ResourceKind};
    use std::time::Duration;

    const MINUTE: u64 = 60;

    /// Farms owned by or shared with the current user.
    pub const USER_FARMS: Resource = Resource {
        kind: ResourceKind::Farms,
        path: "farms:list",
        required: &[],
        ttl: Duration::from_secs(10 * MINUTE),
        user_scoped: true,
    };

    pub const FARM_BY_ID: Resource = Resource {
        kind: ResourceKind::Farms,
        path: "farms:byId",
        required: &["id"],
        ttl: Duration::from_secs(10 * MINUTE),
        user_scoped: true,
    };

    /// Every animal the user can see, joined with its farm's name and location.
    pub const ALL_CATTLE_WITH_FARM_INFO: Resource = Resource {
        kind: ResourceKind::Cattle,
        path: "cattle:withFarmInfo",
        required: &[],
        ttl: Duration::from_secs(5 * MINUTE),
        user_scoped: true,
    };

    pub const CATTLE_BY_FARM: Resource = Resource {
        kind: ResourceKind::Cattle,
        path: "cattle:byFarm",
        required: &["farm"],
        ttl: Duration::from_secs(5 * MINUTE),
        user_scoped: true,
    };

    pub const CATTLE_COUNT_BY_FARM: Resource = Resource {
        kind: ResourceKind::Cattle,
        path: "cattle:countByFarm",
        required: &[],
        ttl: Duration::from_secs(5 * MINUTE),
        user_scoped: true,
    };

    pub const USER_PROFILE: Resource = Resource {
        kind: ResourceKind::Users,
        path: "users/profile",
        required: &[],
        ttl: Duration::from_secs(30 * MINUTE),
        user_scoped: true,
    };

    pub const MEDICAL_BY_COW: Resource = Resource {
        kind: ResourceKind::Medical,
        path: "medical:byCow",
        required: &["cow"],
        ttl: Duration::from_secs(15 * MINUTE),
        user_scoped: true,
    };

    /// Aggregated herd statistics for the reports screen.
    pub const REPORT_SUMMARY: Resource = Resource {
        kind: ResourceKind::Reports,
        path: "reports:summary",
        required: &[],
        ttl: Duration::from_secs(15 * MINUTE),
        user_scoped: true,
    };

    pub const ALL: [Resource; 8] = [
        USER_FARMS,
        FARM_BY_ID,
        ALL_CATTLE_WITH_FARM_INFO,
        CATTLE_BY_FARM,
        CATTLE_COUNT_BY_FARM,
        USER_PROFILE,
        MEDICAL_BY_COW,
        REPORT_SUMMARY,
    ];
}
