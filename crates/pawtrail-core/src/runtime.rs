//! Core runtime: owns the stores, the change channel, the poller, and the
//! event bus, with lifecycle bound to the authenticated identity.
//!
//! There are no module-level singletons; construct one `CoreRuntime` per
//! process and pass it (or handles derived from it) to the frontend. All
//! mutation funnels through the stores' public operations; the change
//! channel is the only source of unsolicited (push-originated) mutation.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::CoreEvent;
use crate::identity::Identity;
use crate::models::{Chat, ChatMessage, Notification, ReportFilter};
use crate::os_notify::OsNotifier;
use crate::realtime::{jittered_period, ChangeChannel, Handler, Poller, Predicate};
use crate::remote::{tables, RemoteStore};
use crate::store::{ChatStore, FeedCache, FeedSnapshot, LoadOutcome, Notifier};

const EVENT_BUS_CAPACITY: usize = 64;

pub struct CoreRuntime {
    config: CoreConfig,
    identity: Arc<Mutex<Option<Identity>>>,
    feed_cache: FeedCache,
    chat_store: ChatStore,
    notifier: Notifier,
    channel: ChangeChannel,
    poller: Poller,
    events: broadcast::Sender<CoreEvent>,
}

impl CoreRuntime {
    pub fn new(config: CoreConfig, store: Arc<dyn RemoteStore>, os: Arc<dyn OsNotifier>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let identity: Arc<Mutex<Option<Identity>>> = Arc::new(Mutex::new(None));

        let feed_cache = FeedCache::new(store.clone(), tables::REPORTS, config.page_size);
        let notifier = Notifier::new(store.clone(), os, events.clone());
        let chat_store = ChatStore::new(
            store.clone(),
            notifier.clone(),
            events.clone(),
            config.mark_read_cooldown,
        );
        let channel = ChangeChannel::new(store);

        // Report changes invalidate feeds rather than patching them; the
        // next read refetches from page one.
        {
            let cache = feed_cache.clone();
            let events = events.clone();
            let handler: Handler = Arc::new(move |event| {
                cache.invalidate_table(&event.table);
                let _ = events.send(CoreEvent::FeedInvalidated {
                    table: event.table.clone(),
                });
            });
            channel.subscribe(tables::REPORTS, None, handler);
        }

        // Chat and message changes merge into the conversation store.
        {
            let chats = chat_store.clone();
            let handler: Handler = Arc::new(move |event| chats.apply_change(event));
            channel.subscribe(tables::CHATS, None, handler.clone());
            channel.subscribe(tables::MESSAGES, None, handler);
        }

        // Notification inserts for the current identity trigger delivery.
        {
            let me = identity.clone();
            let predicate: Predicate = Arc::new(move |row: &Value| {
                let me = me.lock();
                match (me.as_ref(), row.get("recipient_id").and_then(Value::as_str)) {
                    (Some(identity), Some(recipient)) => identity.id == recipient,
                    _ => false,
                }
            });
            let notifier = notifier.clone();
            let handler: Handler = Arc::new(move |event| notifier.deliver(event));
            channel.subscribe(tables::NOTIFICATIONS, Some(predicate), handler);
        }

        Self {
            config,
            identity,
            feed_cache,
            chat_store,
            notifier,
            channel,
            poller: Poller::new(),
            events,
        }
    }

    /// Bind the runtime to a new identity (or none, on logout).
    ///
    /// Tears the change channel and poller down, clears every store so
    /// nothing leaks between sessions, then re-establishes push and the
    /// polling backstop and performs the initial full refresh.
    pub async fn set_identity(&self, identity: Option<Identity>) {
        self.poller.stop();
        self.channel.stop();

        self.feed_cache.clear();
        self.chat_store.set_identity(identity.clone());
        self.notifier.set_identity(identity.clone());
        *self.identity.lock() = identity.clone();

        let Some(identity) = identity else {
            tracing::info!("core runtime detached (logged out)");
            return;
        };

        self.channel.start();
        if let Err(e) = self.chat_store.refresh().await {
            tracing::warn!("initial conversation refresh failed: {e}");
        }
        if let Err(e) = self.notifier.refresh().await {
            tracing::warn!("initial notification refresh failed: {e}");
        }

        let period = jittered_period(
            &identity.id,
            self.config.poll_interval,
            self.config.poll_jitter_frac,
        );
        self.poller
            .start(self.chat_store.clone(), self.notifier.clone(), period);
        tracing::info!(user = identity.id, "core runtime attached");
    }

    /// Follow an identity watch from the auth collaborator; each
    /// login/logout transition rebinds the runtime.
    pub fn watch_identity(
        self: Arc<Self>,
        mut rx: watch::Receiver<Option<Identity>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let identity = rx.borrow_and_update().clone();
                self.set_identity(identity).await;
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    pub fn current_identity(&self) -> Option<Identity> {
        self.identity.lock().clone()
    }

    fn require_identity(&self) -> CoreResult<Identity> {
        self.current_identity().ok_or(CoreError::NoIdentity)
    }

    // ===== Handles exposed to the frontend =====

    /// Subscription-style accessor for a filtered, paginated feed.
    pub fn feed(&self, filter: ReportFilter) -> FeedHandle {
        self.feed_cache.retain(&filter);
        FeedHandle {
            cache: self.feed_cache.clone(),
            filter,
        }
    }

    /// Accessor for one conversation by id.
    pub fn conversation(&self, chat_id: &str) -> ChatHandle {
        ChatHandle {
            chats: self.chat_store.clone(),
            identity: self.identity.clone(),
            chat_id: chat_id.to_string(),
        }
    }

    /// Find or create the conversation with `other_id` about `report_id`
    /// and return a handle to it.
    pub async fn open_conversation(
        &self,
        other_id: &str,
        report_id: Option<&str>,
    ) -> CoreResult<ChatHandle> {
        let me = self.require_identity()?;
        let chat = self
            .chat_store
            .find_or_create(&me.id, other_id, report_id)
            .await?;
        Ok(self.conversation(&chat.id))
    }

    /// The current identity's conversations, most recent activity first.
    pub fn conversations(&self) -> Vec<Chat> {
        match self.current_identity() {
            Some(me) => self.chat_store.chats_for(&me.id),
            None => Vec::new(),
        }
    }

    /// True iff any conversation of the current identity is unread.
    pub fn unread_global(&self) -> bool {
        match self.current_identity() {
            Some(me) => self.chat_store.has_any_unread(&me.id),
            None => false,
        }
    }

    /// Accessor for the current identity's notification list.
    pub fn notifications(&self) -> NotificationsHandle {
        NotificationsHandle {
            notifier: self.notifier.clone(),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }
}

/// Paginated feed accessor. Holds a consumer reference on the cache
/// entry; dropping the handle releases it (and the entry, when no other
/// consumer remains).
pub struct FeedHandle {
    cache: FeedCache,
    filter: ReportFilter,
}

impl FeedHandle {
    pub fn snapshot(&self) -> Arc<FeedSnapshot> {
        self.cache.snapshot(&self.filter)
    }

    pub async fn load_more(&self) -> CoreResult<LoadOutcome> {
        self.cache.load_next(&self.filter).await
    }

    pub fn has_more(&self) -> bool {
        self.snapshot().has_more()
    }

    pub fn filter(&self) -> &ReportFilter {
        &self.filter
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        self.cache.release(&self.filter);
    }
}

/// Accessor for one conversation, bound to the current identity.
pub struct ChatHandle {
    chats: ChatStore,
    identity: Arc<Mutex<Option<Identity>>>,
    chat_id: String,
}

impl ChatHandle {
    pub fn id(&self) -> &str {
        &self.chat_id
    }

    pub fn chat(&self) -> Option<Chat> {
        self.chats.chat(&self.chat_id)
    }

    pub async fn send(&self, text: &str) -> CoreResult<ChatMessage> {
        let me = self.require_identity()?;
        self.chats.send(&self.chat_id, &me, text).await
    }

    pub async fn mark_read(&self) -> CoreResult<bool> {
        let me = self.require_identity()?;
        self.chats.mark_read(&self.chat_id, &me.id).await
    }

    pub fn unread(&self) -> bool {
        match self.identity.lock().as_ref() {
            Some(me) => self.chats.unread_of(&self.chat_id, &me.id),
            None => false,
        }
    }

    fn require_identity(&self) -> CoreResult<Identity> {
        self.identity.lock().clone().ok_or(CoreError::NoIdentity)
    }
}

/// Accessor for the notification list.
pub struct NotificationsHandle {
    notifier: Notifier,
}

impl NotificationsHandle {
    pub fn list(&self) -> Vec<Notification> {
        self.notifier.list()
    }

    pub fn has_unread(&self) -> bool {
        self.notifier.has_unread()
    }

    pub async fn mark_read(&self, id: &str) -> CoreResult<()> {
        self.notifier.mark_read(id).await
    }

    pub async fn refresh(&self) -> CoreResult<()> {
        self.notifier.refresh().await
    }
}
