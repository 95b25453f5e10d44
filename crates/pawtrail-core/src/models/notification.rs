use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A persisted notification row. Created once, mutated only via `is_read`,
/// never deleted by this core. `link` is the in-app routing target the
/// presentation layer deep-links to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub recipient_id: String,
    pub body: String,
    pub link: String,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub created_at: i64,
}

impl Notification {
    pub fn from_row(row: &Value) -> Option<Self> {
        serde_json::from_value(row.clone()).ok()
    }
}
