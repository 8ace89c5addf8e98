//! Shared fixtures for the cache, hook and mutation tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use crate::api::FarmApi;
use crate::cache::store::KeyPredicate;
use crate::cache::{
    CacheConfig, CacheManager, ManualClock, MemoryStore, PersistentStore, StorageError,
};
use crate::models::{
    Cattle, CattleWithFarmInfo, Farm, FarmCattleCount, MedicalRecord, NewFarm, NewMedicalRecord,
    ReportSummary, Sex, UserProfile,
};

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(epoch()))
}

pub fn manager(store: Arc<dyn PersistentStore>, clock: Arc<ManualClock>) -> CacheManager {
    CacheManager::with_clock(CacheConfig::default(), store, clock)
}

pub fn memory_manager(clock: Arc<ManualClock>) -> (CacheManager, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    (manager(store.clone(), clock), store)
}

/// A store whose every operation fails, like a full or read-only disk.
#[derive(Default)]
pub struct FailingStore;

#[async_trait]
impl PersistentStore for FailingStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Err(StorageError::io(key, "device unavailable"))
    }

    async fn set(&self, key: &str, _value: String) -> Result<(), StorageError> {
        Err(StorageError::io(key, "device unavailable"))
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        Err(StorageError::io(key, "device unavailable"))
    }

    async fn remove_where(&self, _predicate: KeyPredicate<'_>) -> Result<usize, StorageError> {
        Err(StorageError::Unavailable("device unavailable".into()))
    }

    async fn all_keys(&self) -> Result<Vec<String>, StorageError> {
        Err(StorageError::Unavailable("device unavailable".into()))
    }
}

pub fn farm(id: i64, name: &str, owner: &str) -> Farm {
    Farm {
        id,
        name: name.to_string(),
        location: None,
        owner_id: owner.to_string(),
        area_hectares: None,
    }
}

pub fn cow(id: i64, farm_id: i64) -> Cattle {
    Cattle {
        id,
        tag_number: format!("T-{}", id),
        name: None,
        farm_id,
        breed: Some("Angus".to_string()),
        sex: Sex::Female,
        birth_date: None,
        weight_kg: None,
    }
}

/// In-memory backend that counts calls per operation.
#[derive(Default)]
pub struct FakeApi {
    farms: Mutex<Vec<Farm>>,
    cattle: Mutex<Vec<Cattle>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    failing: AtomicBool,
    delay_ms: AtomicU64,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_farms(farms: Vec<Farm>) -> Self {
        let api = Self::new();
        *api.farms.lock() = farms;
        api
    }

    pub fn set_farms(&self, farms: Vec<Farm>) {
        *self.farms.lock() = farms;
    }

    pub fn set_cattle(&self, cattle: Vec<Cattle>) {
        *self.cattle.lock() = cattle;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn calls(&self, op: &str) -> usize {
        self.calls.lock().get(op).copied().unwrap_or(0)
    }

    async fn enter(&self, op: &'static str) -> Result<()> {
        *self.calls.lock().entry(op).or_default() += 1;
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            bail!("{} failed: backend unavailable", op);
        }
        Ok(())
    }
}

#[async_trait]
impl FarmApi for FakeApi {
    async fn list_farms(&self, user_id: &str) -> Result<Vec<Farm>> {
        self.enter("list_farms").await?;
        Ok(self
            .farms
            .lock()
            .iter()
            .filter(|f| f.owner_id == user_id)
            .cloned()
            .collect())
    }

    async fn fetch_farm(&self, farm_id: i64) -> Result<Farm> {
        self.enter("fetch_farm").await?;
        match self.farms.lock().iter().find(|f| f.id == farm_id) {
            Some(found) => Ok(found.clone()),
            None => bail!("farm {} not found", farm_id),
        }
    }

    async fn list_cattle_with_farm_info(&self, user_id: &str) -> Result<Vec<CattleWithFarmInfo>> {
        self.enter("list_cattle_with_farm_info").await?;
        let farms = self.farms.lock().clone();
        Ok(self
            .cattle
            .lock()
            .iter()
            .filter_map(|c| {
                let owner = farms
                    .iter()
                    .find(|f| f.id == c.farm_id && f.owner_id == user_id)?;
                Some(CattleWithFarmInfo {
                    cattle: c.clone(),
                    farm_name: owner.name.clone(),
                    farm_location: owner.location.clone(),
                })
            })
            .collect())
    }

    async fn list_cattle_by_farm(&self, farm_id: i64) -> Result<Vec<Cattle>> {
        self.enter("list_cattle_by_farm").await?;
        Ok(self
            .cattle
            .lock()
            .iter()
            .filter(|c| c.farm_id == farm_id)
            .cloned()
            .collect())
    }

    async fn cattle_count_by_farm(&self, user_id: &str) -> Result<Vec<FarmCattleCount>> {
        self.enter("cattle_count_by_farm").await?;
        let cattle = self.cattle.lock().clone();
        Ok(self
            .farms
            .lock()
            .iter()
            .filter(|f| f.owner_id == user_id)
            .map(|f| FarmCattleCount {
                farm_id: f.id,
                count: cattle.iter().filter(|c| c.farm_id == f.id).count() as u32,
            })
            .collect())
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<UserProfile> {
        self.enter("fetch_profile").await?;
        Ok(UserProfile {
            id: user_id.to_string(),
            first_name: "Ada".to_string(),
            last_name: "Rancher".to_string(),
            email: None,
            farm_name: None,
        })
    }

    async fn list_medical_records(&self, _cattle_id: i64) -> Result<Vec<MedicalRecord>> {
        self.enter("list_medical_records").await?;
        Ok(Vec::new())
    }

    async fn fetch_report_summary(&self, _user_id: &str) -> Result<ReportSummary> {
        self.enter("fetch_report_summary").await?;
        Ok(ReportSummary {
            total_cattle: self.cattle.lock().len() as u32,
            ..ReportSummary::default()
        })
    }

    async fn create_farm(&self, user_id: &str, new: &NewFarm) -> Result<Farm> {
        self.enter("create_farm").await?;
        let mut farms = self.farms.lock();
        let id = farms.iter().map(|f| f.id).max().unwrap_or(0) + 1;
        let created = Farm {
            id,
            name: new.name.clone(),
            location: new.location.clone(),
            owner_id: user_id.to_string(),
            area_hectares: new.area_hectares,
        };
        farms.push(created.clone());
        Ok(created)
    }

    async fn update_farm(&self, updated: &Farm) -> Result<Farm> {
        self.enter("update_farm").await?;
        let mut farms = self.farms.lock();
        match farms.iter_mut().find(|f| f.id == updated.id) {
            Some(existing) => {
                *existing = updated.clone();
                Ok(updated.clone())
            }
            None => bail!("farm {} not found", updated.id),
        }
    }

    async fn delete_farm(&self, farm_id: i64) -> Result<()> {
        self.enter("delete_farm").await?;
        self.farms.lock().retain(|f| f.id != farm_id);
        Ok(())
    }

    async fn move_cattle(&self, cattle_id: i64, farm_id: i64) -> Result<Cattle> {
        self.enter("move_cattle").await?;
        let mut cattle = self.cattle.lock();
        match cattle.iter_mut().find(|c| c.id == cattle_id) {
            Some(animal) => {
                animal.farm_id = farm_id;
                Ok(animal.clone())
            }
            None => bail!("cattle {} not found", cattle_id),
        }
    }

    async fn update_profile(&self, profile: &UserProfile) -> Result<UserProfile> {
        self.enter("update_profile").await?;
        Ok(profile.clone())
    }

    async fn add_medical_record(&self, record: &NewMedicalRecord) -> Result<MedicalRecord> {
        self.enter("add_medical_record").await?;
        Ok(MedicalRecord {
            id: 1,
            cattle_id: record.cattle_id,
            date: record.date,
            treatment: record.treatment.clone(),
            notes: record.notes.clone(),
            withdrawal_until: record.withdrawal_until,
        })
    }
}
