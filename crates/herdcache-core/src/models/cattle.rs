use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Female,
    Male,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cattle {
    pub id: i64,
    #[serde(rename = "tagNumber")]
    pub tag_number: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "farmId")]
    pub farm_id: i64,
    #[serde(default)]
    pub breed: Option<String>,
    pub sex: Sex,
    #[serde(rename = "birthDate", default)]
    pub birth_date: Option<NaiveDate>,
    #[serde(rename = "weightKg", default)]
    pub weight_kg: Option<f64>,
}

impl Cattle {
    /// Name if the animal has one, otherwise its ear tag.
    pub fn display_name(&self) -> String {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => format!("{} ({})", name, self.tag_number),
            _ => self.tag_number.clone(),
        }
    }

    pub fn age_months(&self, today: NaiveDate) -> Option<i64> {
        let born = self.birth_date?;
        let months = i64::from(today.year() - born.year()) * 12
            + i64::from(today.month0())
            - i64::from(born.month0());
        Some(months.max(0))
    }
}

/// An animal joined with the farm it is currently assigned to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CattleWithFarmInfo {
    #[serde(flatten)]
    pub cattle: Cattle,
    #[serde(rename = "farmName")]
    pub farm_name: String,
    #[serde(rename = "farmLocation", default)]
    pub farm_location: Option<String>,
}
