//! One-shot guard breaking the mark-read feedback loop.
//!
//! Marking a chat read updates local state, which re-renders the message
//! list, which re-triggers the read check. Without a guard that cycle
//! issues an unbounded stream of identical writes. The guard admits one
//! write per (chat, reader) at a time and keeps the gate closed for a
//! bounded cooldown after it completes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy)]
enum GateState {
    /// A write is in flight; no expiry.
    InFlight,
    /// A write completed; closed until the deadline passes.
    CoolingDown(Instant),
}

pub struct ReadGuard {
    cooldown: Duration,
    gates: Mutex<HashMap<(String, String), GateState>>,
}

impl ReadGuard {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Try to acquire the gate for (chat, reader). Returns false if a write
    /// is in flight or the cooldown has not elapsed.
    pub fn try_begin(&self, chat_id: &str, reader_id: &str) -> bool {
        let key = (chat_id.to_string(), reader_id.to_string());
        let mut gates = self.gates.lock();
        match gates.get(&key) {
            Some(GateState::InFlight) => false,
            Some(GateState::CoolingDown(deadline)) if Instant::now() < *deadline => false,
            _ => {
                gates.insert(key, GateState::InFlight);
                true
            }
        }
    }

    /// The write succeeded; keep the gate closed for the cooldown.
    pub fn finish(&self, chat_id: &str, reader_id: &str) {
        let key = (chat_id.to_string(), reader_id.to_string());
        self.gates
            .lock()
            .insert(key, GateState::CoolingDown(Instant::now() + self.cooldown));
    }

    /// The write failed; reopen immediately so a retry is possible.
    pub fn abort(&self, chat_id: &str, reader_id: &str) {
        let key = (chat_id.to_string(), reader_id.to_string());
        self.gates.lock().remove(&key);
    }

    pub fn clear(&self) {
        self.gates.lock().clear();
    }
}
