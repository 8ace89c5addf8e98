//! Writes to the backend, each followed by invalidation of every resource
//! derived from what changed.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::api::FarmApi;
use crate::cache::{catalog, CacheManager, InvalidationOutcome, Params, ResourceKind};
use crate::models::{Cattle, Farm, MedicalRecord, NewFarm, NewMedicalRecord, UserProfile};

#[derive(Clone)]
pub struct Mutations {
    cache: CacheManager,
    api: Arc<dyn FarmApi>,
    user_id: Option<String>,
}

impl Mutations {
    pub fn new(cache: CacheManager, api: Arc<dyn FarmApi>, user_id: Option<String>) -> Self {
        Self {
            cache,
            api,
            user_id,
        }
    }

    fn user(&self) -> Result<&str> {
        self.user_id.as_deref().context("No signed-in user")
    }

    async fn invalidate(&self, kind: ResourceKind) -> InvalidationOutcome {
        let outcome = self.cache.invalidate_kind(kind).await;
        debug!(kind = %kind, removed = outcome.total(), "Invalidated after mutation");
        outcome
    }

    pub async fn create_farm(&self, farm: &NewFarm) -> Result<Farm> {
        let created = self.api.create_farm(self.user()?, farm).await?;
        self.invalidate(ResourceKind::Farms).await;
        Ok(created)
    }

    /// Update a farm, then seed its detail entry with the saved copy.
    pub async fn update_farm(&self, farm: &Farm) -> Result<Farm> {
        let saved = self.api.update_farm(farm).await?;
        self.invalidate(ResourceKind::Farms).await;

        let params = Params::new().with("id", saved.id);
        if let Err(e) = self
            .cache
            .set(&catalog::FARM_BY_ID, &params, self.user_id.as_deref(), &saved, None)
            .await
        {
            warn!(farm_id = saved.id, error = %e, "Failed to seed updated farm");
        }
        Ok(saved)
    }

    pub async fn delete_farm(&self, farm_id: i64) -> Result<()> {
        self.api.delete_farm(farm_id).await?;
        self.invalidate(ResourceKind::Farms).await;
        Ok(())
    }

    /// Reassign an animal to another farm.
    pub async fn move_cattle(&self, cattle_id: i64, farm_id: i64) -> Result<Cattle> {
        let moved = self.api.move_cattle(cattle_id, farm_id).await?;
        self.invalidate(ResourceKind::Cattle).await;
        Ok(moved)
    }

    pub async fn update_profile(&self, profile: &UserProfile) -> Result<UserProfile> {
        let saved = self.api.update_profile(profile).await?;
        self.invalidate(ResourceKind::Users).await;

        if let Err(e) = self
            .cache
            .set(
                &catalog::USER_PROFILE,
                &Params::new(),
                self.user_id.as_deref(),
                &saved,
                None,
            )
            .await
        {
            warn!(error = %e, "Failed to seed updated profile");
        }
        Ok(saved)
    }

    pub async fn add_medical_record(&self, record: &NewMedicalRecord) -> Result<MedicalRecord> {
        let added = self.api.add_medical_record(record).await?;
        self.invalidate(ResourceKind::Medical).await;
        Ok(added)
    }
}
