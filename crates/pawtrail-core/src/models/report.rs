use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Lost,
    Found,
    Reunited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Species {
    Dog,
    Cat,
    Bird,
    Rabbit,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PetSize {
    Small,
    Medium,
    Large,
}

/// A lost/found classified: the resource flowing through the paginated
/// feed. Owned by the remote store; this is the client-side mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PetReport {
    pub id: String,
    pub status: ReportStatus,
    pub species: Species,
    #[serde(default)]
    pub breed: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub size: Option<PetSize>,
    #[serde(default)]
    pub pet_name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub photo_url: Option<String>,
    pub reporter_id: String,
    #[serde(default)]
    pub created_at: i64,
}

impl PetReport {
    /// Parse a raw store row. Rows carry extra store-assigned fields
    /// (`seq`); anything unparseable is skipped rather than surfaced.
    pub fn from_row(row: &Value) -> Option<Self> {
        serde_json::from_value(row.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_row_parses_store_row_with_extra_fields() {
        let row = json!({
            "id": "r1",
            "status": "lost",
            "species": "dog",
            "breed": "beagle",
            "reporter_id": "alice",
            "created_at": 1234,
            "seq": 7,
        });
        let report = PetReport::from_row(&row).unwrap();
        assert_eq!(report.status, ReportStatus::Lost);
        assert_eq!(report.species, Species::Dog);
        assert_eq!(report.breed.as_deref(), Some("beagle"));
        assert_eq!(report.created_at, 1234);
    }

    #[test]
    fn from_row_rejects_malformed_rows() {
        assert!(PetReport::from_row(&json!({"id": "r1"})).is_none());
        assert!(PetReport::from_row(&json!("not an object")).is_none());
    }
}
