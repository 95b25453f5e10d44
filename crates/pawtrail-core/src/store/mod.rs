pub mod chat_store;
pub mod feed_cache;
pub mod notifier;
pub mod read_guard;

pub use chat_store::ChatStore;
pub use feed_cache::{FeedCache, FeedSnapshot, LoadOutcome};
pub use notifier::Notifier;
pub use read_guard::ReadGuard;
