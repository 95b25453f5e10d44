use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::message::ChatMessage;

/// A two-party conversation, optionally linked to a report.
///
/// `messages` is kept sorted non-decreasingly by `(created_at, seq)` and
/// is not part of the chat row itself; message rows live in their own
/// table and are joined client-side. `last_read` maps participant id to
/// the newest timestamp that participant has seen; absent participants
/// default to the epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub pair_key: String,
    #[serde(default)]
    pub report_id: Option<String>,
    pub participants: Vec<String>,
    #[serde(default)]
    pub last_read: HashMap<String, i64>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(skip)]
    pub messages: Vec<ChatMessage>,
}

impl Chat {
    pub fn from_row(row: &Value) -> Option<Self> {
        serde_json::from_value(row.clone()).ok()
    }

    /// Canonical key for the (unordered participant pair, linked report)
    /// tuple. Participants are sorted before hashing so both sides of a
    /// conversation derive the same key.
    pub fn pair_key(a: &str, b: &str, report_id: Option<&str>) -> String {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let mut hasher = Sha256::new();
        hasher.update(lo.as_bytes());
        hasher.update([0u8]);
        hasher.update(hi.as_bytes());
        hasher.update([0u8]);
        hasher.update(report_id.unwrap_or("").as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }

    pub fn other_participant(&self, me: &str) -> Option<&str> {
        self.participants
            .iter()
            .find(|p| p.as_str() != me)
            .map(String::as_str)
    }

    pub fn last_read_for(&self, user_id: &str) -> i64 {
        self.last_read.get(user_id).copied().unwrap_or(0)
    }

    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    /// True iff the conversation has messages, the newest one was sent by
    /// someone else, and the viewer has not read past it.
    pub fn unread_for(&self, viewer_id: &str) -> bool {
        match self.last_message() {
            Some(last) => {
                last.sender_id != viewer_id && last.created_at > self.last_read_for(viewer_id)
            }
            None => false,
        }
    }

    /// Insert a message preserving `(created_at, seq)` order; duplicates
    /// (by id) are dropped. Returns whether the message was new.
    pub fn insert_message(&mut self, message: ChatMessage) -> bool {
        if self.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        let pos = self
            .messages
            .partition_point(|m| m.order_key() <= message.order_key());
        self.messages.insert(pos, message);
        true
    }

    /// Merge a remote read-state map, taking the max per participant.
    /// Each participant only ever writes their own key, so last-writer-wins
    /// per key cannot conflict across writers.
    pub fn merge_last_read(&mut self, incoming: &HashMap<String, i64>) {
        for (user, &ts) in incoming {
            let entry = self.last_read.entry(user.clone()).or_insert(0);
            if ts > *entry {
                *entry = ts;
            }
        }
    }

    pub fn set_last_read(&mut self, user_id: &str, ts: i64) {
        let entry = self.last_read.entry(user_id.to_string()).or_insert(0);
        if ts > *entry {
            *entry = ts;
        }
    }
}
