use serde::{Deserialize, Serialize};

/// Waste categories accepted at pickup and bag registration.
///
/// Stored as the `waste_category` Postgres enum. Unknown strings arriving at
/// the API boundary are rejected by serde before reaching the core, so
/// `General` is the fallback rate, not a fallback variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "waste_category", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WasteCategory {
    Hazardous,
    Plastic,
    Organic,
    Recyclable,
    Paper,
    General,
}

impl WasteCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            WasteCategory::Hazardous => "hazardous",
            WasteCategory::Plastic => "plastic",
            WasteCategory::Organic => "organic",
            WasteCategory::Recyclable => "recyclable",
            WasteCategory::Paper => "paper",
            WasteCategory::General => "general",
        }
    }
}
