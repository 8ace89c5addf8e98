//! Data models for the farm client's remote collections.
//!
//! - `Farm`, `NewFarm`, `FarmCattleCount`: farms and per-farm head counts
//! - `Cattle`, `CattleWithFarmInfo`: animals, optionally joined with their farm
//! - `UserProfile`: the signed-in user's profile
//! - `MedicalRecord`, `NewMedicalRecord`: treatment history per animal
//! - `ReportSummary`: aggregated herd statistics served by the backend

pub mod cattle;
pub mod farm;
pub mod medical;
pub mod report;
pub mod user;

pub use cattle::{Cattle, CattleWithFarmInfo, Sex};
pub use farm::{Farm, FarmCattleCount, NewFarm};
pub use medical::{MedicalRecord, NewMedicalRecord};
pub use report::ReportSummary;
pub use user::UserProfile;
