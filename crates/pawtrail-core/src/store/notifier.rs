//! Notification creation, local delivery, and presentation hand-off.
//!
//! Creation is fire-and-forget: a failed notification write must never
//! make the triggering action (message send, comment post) appear to
//! fail. Delivery is at-most-once per session: replayed change events for
//! an already-presented row are suppressed.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::broadcast;

use crate::error::{CoreError, CoreResult};
use crate::events::CoreEvent;
use crate::identity::Identity;
use crate::models::Notification;
use crate::os_notify::OsNotifier;
use crate::remote::{tables, ChangeEvent, ChangeOp, Filter, Order, Range, RemoteStore};

/// Upper bound on a full notification-list fetch.
const LIST_FETCH_LIMIT: u64 = 200;

/// App title used for OS-level presentations.
const OS_TITLE: &str = "Pawtrail";

struct State {
    identity: Option<Identity>,
    /// Newest first.
    list: Vec<Notification>,
    /// Rows already presented this session (toast/OS); replays skip these.
    presented: HashSet<String>,
}

struct Inner {
    store: Arc<dyn RemoteStore>,
    os: Arc<dyn OsNotifier>,
    events: broadcast::Sender<CoreEvent>,
    state: Mutex<State>,
}

#[derive(Clone)]
pub struct Notifier {
    inner: Arc<Inner>,
}

impl Notifier {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        os: Arc<dyn OsNotifier>,
        events: broadcast::Sender<CoreEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                os,
                events,
                state: Mutex::new(State {
                    identity: None,
                    list: Vec::new(),
                    presented: HashSet::new(),
                }),
            }),
        }
    }

    /// Rebind to a new identity, dropping all session-local state.
    pub fn set_identity(&self, identity: Option<Identity>) {
        let mut state = self.inner.state.lock();
        state.identity = identity;
        state.list.clear();
        state.presented.clear();
    }

    /// Write a notification record in the background. Never awaited by the
    /// caller's success path; failures are logged and swallowed.
    pub fn notify(&self, recipient_id: &str, body: &str, link: &str) {
        let inner = self.inner.clone();
        let row = json!({
            "recipient_id": recipient_id,
            "body": body,
            "link": link,
            "is_read": false,
        });
        let recipient = recipient_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = inner.store.insert(tables::NOTIFICATIONS, row).await {
                tracing::warn!(recipient, "notification write failed (dropped): {e}");
            }
        });
    }

    /// Handle a change event for the notifications table. Inserts addressed
    /// to the current identity update the local list and trigger one toast
    /// and one best-effort OS presentation, exactly once per row.
    pub fn deliver(&self, event: &ChangeEvent) {
        if event.op != ChangeOp::Insert {
            return;
        }
        let Some(notification) = Notification::from_row(&event.row) else {
            tracing::warn!("unparseable notification row in change event");
            return;
        };

        let present = {
            let mut state = self.inner.state.lock();
            let is_mine = state
                .identity
                .as_ref()
                .is_some_and(|id| id.id == notification.recipient_id);
            if !is_mine || !state.presented.insert(notification.id.clone()) {
                false
            } else {
                if !state.list.iter().any(|n| n.id == notification.id) {
                    state.list.insert(0, notification.clone());
                }
                true
            }
        };

        if present {
            let _ = self
                .inner
                .events
                .send(CoreEvent::Toast(notification.clone()));
            let _ = self.inner.events.send(CoreEvent::NotificationsUpdated);
            if self.inner.os.permission_granted() {
                self.inner
                    .os
                    .show(OS_TITLE, &notification.body, &notification.link);
            }
        }
    }

    /// Full list refetch. Recovers anything a missed push dropped; fetched
    /// rows are marked presented so a later replayed event stays silent.
    pub async fn refresh(&self) -> CoreResult<()> {
        let me = self
            .inner
            .state
            .lock()
            .identity
            .clone()
            .ok_or(CoreError::NoIdentity)?;

        let (rows, _total) = self
            .inner
            .store
            .query(
                tables::NOTIFICATIONS,
                &[Filter::Eq("recipient_id", json!(me.id))],
                Order::desc("created_at"),
                Range::new(0, LIST_FETCH_LIMIT),
            )
            .await
            .map_err(CoreError::from)?;

        let list: Vec<Notification> = rows.iter().filter_map(Notification::from_row).collect();
        {
            let mut state = self.inner.state.lock();
            // Identity may have changed while the fetch was in flight.
            if state.identity.as_ref().map(|i| i.id.as_str()) != Some(me.id.as_str()) {
                return Ok(());
            }
            for n in &list {
                state.presented.insert(n.id.clone());
            }
            state.list = list;
        }
        let _ = self.inner.events.send(CoreEvent::NotificationsUpdated);
        Ok(())
    }

    /// Flip a notification's read flag, locally and remotely.
    pub async fn mark_read(&self, id: &str) -> CoreResult<()> {
        self.inner
            .store
            .update(tables::NOTIFICATIONS, id, json!({"is_read": true}))
            .await
            .map_err(CoreError::from)?;
        {
            let mut state = self.inner.state.lock();
            if let Some(n) = state.list.iter_mut().find(|n| n.id == id) {
                n.is_read = true;
            }
        }
        let _ = self.inner.events.send(CoreEvent::NotificationsUpdated);
        Ok(())
    }

    pub fn list(&self) -> Vec<Notification> {
        self.inner.state.lock().list.clone()
    }

    pub fn has_unread(&self) -> bool {
        self.inner.state.lock().list.iter().any(|n| !n.is_read)
    }
}
