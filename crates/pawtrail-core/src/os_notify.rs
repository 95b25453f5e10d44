//! OS-level notification collaborator.
//!
//! The core never requests permission itself; the surrounding UI does.
//! It only reads the current grant and fires best-effort presentations.

/// Consumed by the notifier for system-level (outside the app window)
/// notification presentation.
pub trait OsNotifier: Send + Sync {
    /// Whether the user has previously granted notification permission.
    fn permission_granted(&self) -> bool;

    /// Present a system notification routed to `deep_link`. Best-effort;
    /// implementations swallow and log their own failures.
    fn show(&self, title: &str, body: &str, deep_link: &str);
}

/// Logs instead of presenting. Used by the CLI and tests.
pub struct LogNotifier {
    granted: bool,
}

impl LogNotifier {
    pub fn new(granted: bool) -> Self {
        Self { granted }
    }
}

impl OsNotifier for LogNotifier {
    fn permission_granted(&self) -> bool {
        self.granted
    }

    fn show(&self, title: &str, body: &str, deep_link: &str) {
        tracing::info!(title, deep_link, "os notification: {body}");
    }
}
