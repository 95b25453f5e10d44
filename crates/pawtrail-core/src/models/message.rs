use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One message in a conversation. Immutable once created.
///
/// Ordering is by `created_at` with the store-assigned `seq` as the
/// tie-break, so two messages written within the same millisecond (or with
/// skewed client clocks) still have one total order per chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub text: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub seq: i64,
}

impl ChatMessage {
    pub fn from_row(row: &Value) -> Option<Self> {
        serde_json::from_value(row.clone()).ok()
    }

    pub fn order_key(&self) -> (i64, i64) {
        (self.created_at, self.seq)
    }
}
