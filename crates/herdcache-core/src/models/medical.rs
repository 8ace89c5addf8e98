use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicalRecord {
    pub id: i64,
    #[serde(rename = "cattleId")]
    pub cattle_id: i64,
    pub date: NaiveDate,
    pub treatment: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(rename = "withdrawalUntil", default)]
    pub withdrawal_until: Option<NaiveDate>,
}

impl MedicalRecord {
    /// Milk/meat withdrawal period still running on `today`.
    pub fn in_withdrawal(&self, today: NaiveDate) -> bool {
        self.withdrawal_until.is_some_and(|until| today <= until)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMedicalRecord {
    #[serde(rename = "cattleId")]
    pub cattle_id: i64,
    pub date: NaiveDate,
    pub treatment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(rename = "withdrawalUntil", skip_serializing_if = "Option::is_none")]
    pub withdrawal_until: Option<NaiveDate>,
}
