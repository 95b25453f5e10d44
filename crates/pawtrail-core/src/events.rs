use crate::models::Notification;

/// Events pushed from the core to whatever frontend is attached.
/// Delivered over a `tokio::sync::broadcast` channel; slow consumers may
/// lag and should treat a `Lagged` recv error as "re-read current state".
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// A notification addressed to the current identity arrived and should
    /// be presented transiently.
    Toast(Notification),
    /// A conversation gained a message or changed read-state.
    ConversationUpdated { chat_id: String },
    /// Cached feed pages for a table were invalidated; visible feeds should
    /// re-read their snapshot (and will refetch on next load).
    FeedInvalidated { table: String },
    /// The notification list changed (new row or read-state flip).
    NotificationsUpdated,
}
