use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Herd statistics as computed by the backend. The client only caches it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    #[serde(rename = "totalCattle")]
    pub total_cattle: u32,
    #[serde(rename = "totalFarms")]
    pub total_farms: u32,
    #[serde(rename = "byBreed", default)]
    pub by_breed: BTreeMap<String, u32>,
    #[serde(rename = "inTreatment", default)]
    pub in_treatment: u32,
    #[serde(rename = "averageWeightKg", default)]
    pub average_weight_kg: Option<f64>,
}
