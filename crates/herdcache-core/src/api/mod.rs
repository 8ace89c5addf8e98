//! Boundary to the farm backend.
//!
//! The cache layer treats the backend as one opaque fetch function per
//! resource. [`FarmApi`] is that set of functions; [`ApiClient`] implements it
//! over REST. Implementations must not cache on their own.

pub mod client;
pub mod error;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    Cattle, CattleWithFarmInfo, Farm, FarmCattleCount, MedicalRecord, NewFarm, NewMedicalRecord,
    ReportSummary, UserProfile,
};

pub use client::ApiClient;
pub use error::ApiError;

#[async_trait]
pub trait FarmApi: Send + Sync {
    // ===== Reads =====

    async fn list_farms(&self, user_id: &str) -> Result<Vec<Farm>>;

    async fn fetch_farm(&self, farm_id: i64) -> Result<Farm>;

    async fn list_cattle_with_farm_info(&self, user_id: &str) -> Result<Vec<CattleWithFarmInfo>>;

    async fn list_cattle_by_farm(&self, farm_id: i64) -> Result<Vec<Cattle>>;

    async fn cattle_count_by_farm(&self, user_id: &str) -> Result<Vec<FarmCattleCount>>;

    async fn fetch_profile(&self, user_id: &str) -> Result<UserProfile>;

    async fn list_medical_records(&self, cattle_id: i64) -> Result<Vec<MedicalRecord>>;

    async fn fetch_report_summary(&self, user_id: &str) -> Result<ReportSummary>;

    // ===== Mutations =====

    async fn create_farm(&self, user_id: &str, farm: &NewFarm) -> Result<Farm>;

    async fn update_farm(&self, farm: &Farm) -> Result<Farm>;

    async fn delete_farm(&self, farm_id: i64) -> Result<()>;

    /// Reassign an animal to another farm.
    async fn move_cattle(&self, cattle_id: i64, farm_id: i64) -> Result<Cattle>;

    async fn update_profile(&self, profile: &UserProfile) -> Result<UserProfile>;

    async fn add_medical_record(&self, record: &NewMedicalRecord) -> Result<MedicalRecord>;
}
