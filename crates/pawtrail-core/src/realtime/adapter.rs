//! Change channel adapter.
//!
//! One process-wide task owns the store's change streams (one per table,
//! regardless of subscriber count) and fans events out to registered
//! handlers. Lifecycle is bound to the authenticated identity: `stop` on
//! logout, `start` again on login, so no events leak across sessions.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::remote::{ChangeEvent, RemoteStore};

pub type Handler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;
pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

#[derive(Clone)]
struct Subscription {
    table: String,
    predicate: Option<Predicate>,
    handler: Handler,
}

struct Inner {
    store: Arc<dyn RemoteStore>,
    subscriptions: Mutex<Vec<Subscription>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct ChangeChannel {
    inner: Arc<Inner>,
}

impl ChangeChannel {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                subscriptions: Mutex::new(Vec::new()),
                task: Mutex::new(None),
            }),
        }
    }

    /// Register interest in a table's change events, optionally filtered.
    /// Subscriptions registered after `start` take effect on the next
    /// (re)start; in practice all wiring happens before login.
    pub fn subscribe(&self, table: &str, predicate: Option<Predicate>, handler: Handler) {
        self.inner.subscriptions.lock().push(Subscription {
            table: table.to_string(),
            predicate,
            handler,
        });
    }

    pub fn is_running(&self) -> bool {
        self.inner.task.lock().is_some()
    }

    /// Open one stream per subscribed table and start fanning out. Any
    /// previous task is torn down first.
    pub fn start(&self) {
        self.stop();

        let subscriptions = self.inner.subscriptions.lock().clone();
        let tables: HashSet<String> = subscriptions.iter().map(|s| s.table.clone()).collect();
        let streams: Vec<_> = tables
            .iter()
            .map(|table| self.inner.store.subscribe_changes(table))
            .collect();
        let mut merged = stream::select_all(streams);

        let handle = tokio::spawn(async move {
            while let Some(event) = merged.next().await {
                for sub in &subscriptions {
                    if sub.table != event.table {
                        continue;
                    }
                    if let Some(predicate) = &sub.predicate {
                        if !predicate(&event.row) {
                            continue;
                        }
                    }
                    // Handlers log their own failures; nothing a handler
                    // does may stall processing of subsequent events.
                    (sub.handler)(&event);
                }
            }
            tracing::debug!("change channel streams closed");
        });
        *self.inner.task.lock() = Some(handle);
    }

    /// Tear the shared task down. Registered subscriptions are kept for
    /// the next `start`.
    pub fn stop(&self) {
        if let Some(handle) = self.inner.task.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}
