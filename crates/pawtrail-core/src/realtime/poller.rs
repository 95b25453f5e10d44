//! Polling backstop for the push channel.
//!
//! A silently broken change stream must not freeze the app on stale data,
//! so the chat store and notification list are refetched on a fixed
//! interval regardless of push health. The interval carries a
//! deterministic per-identity jitter so a fleet of clients does not
//! synchronize its refetches.

use std::time::Duration;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;

use crate::store::{ChatStore, Notifier};

pub struct Poller {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller {
    pub fn new() -> Self {
        Self {
            task: Mutex::new(None),
        }
    }

    /// Begin periodic refreshes. Replaces any previous polling task.
    pub fn start(&self, chats: ChatStore, notifier: Notifier, period: Duration) {
        self.stop();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately; the login path already did
            // an initial refresh, so skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = chats.refresh().await {
                    tracing::warn!("poll refresh of conversations failed: {e}");
                }
                if let Err(e) = notifier.refresh().await {
                    tracing::warn!("poll refresh of notifications failed: {e}");
                }
            }
        });
        *self.task.lock() = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Deterministic per-identity jitter in `[0, base * frac]`, derived from a
/// SHA-256 of the identity id so every session of one identity lands on
/// the same offset while different identities spread out.
pub fn jittered_period(identity_id: &str, base: Duration, frac: f64) -> Duration {
    let mut hasher = Sha256::new();
    hasher.update(identity_id.as_bytes());
    let digest = hasher.finalize();
    let value = u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ]);
    let unit = (value % 1000) as f64 / 1000.0;
    let jitter = base.mul_f64(frac.clamp(0.0, 1.0) * unit);
    base + jitter
}
