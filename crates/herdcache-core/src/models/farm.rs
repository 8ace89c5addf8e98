use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Farm {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(rename = "ownerId")]
    pub owner_id: String,
    #[serde(rename = "areaHectares", default)]
    pub area_hectares: Option<f64>,
}

impl Farm {
    pub fn display_location(&self) -> String {
        match self.location.as_deref() {
            Some(loc) if !loc.trim().is_empty() => loc.to_string(),
            _ => "No location".to_string(),
        }
    }
}

/// Payload for creating a farm; the backend assigns the id and owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFarm {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(rename = "areaHectares", skip_serializing_if = "Option::is_none")]
    pub area_hectares: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FarmCattleCount {
    #[serde(rename = "farmId")]
    pub farm_id: i64,
    pub count: u32,
}
