pub mod chat;
pub mod filter;
pub mod message;
pub mod notification;
pub mod report;

pub use chat::Chat;
pub use filter::ReportFilter;
pub use message::ChatMessage;
pub use notification::Notification;
pub use report::{PetReport, PetSize, ReportStatus, Species};
