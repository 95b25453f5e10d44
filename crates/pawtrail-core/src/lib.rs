pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod models;
pub mod os_notify;
pub mod realtime;
pub mod remote;
pub mod runtime;
pub mod store;

pub use config::CoreConfig;
pub use error::{CoreError, CoreResult, StoreError};
pub use events::CoreEvent;
pub use identity::Identity;
pub use os_notify::{LogNotifier, OsNotifier};
pub use runtime::{ChatHandle, CoreRuntime, FeedHandle, NotificationsHandle};
