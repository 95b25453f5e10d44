use std::time::Duration;

/// Tuning knobs for the sync core. Defaults match production behavior;
/// tests shrink the durations.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Items fetched per feed page.
    pub page_size: u64,
    /// Base interval for the polling backstop.
    pub poll_interval: Duration,
    /// Maximum jitter applied to the poll interval, as a fraction of it.
    pub poll_jitter_frac: f64,
    /// Cooldown after a successful mark-read write during which further
    /// mark-read calls for the same (chat, reader) are suppressed.
    pub mark_read_cooldown: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            page_size: 12,
            poll_interval: Duration::from_secs(30),
            poll_jitter_frac: 0.2,
            mark_read_cooldown: Duration::from_millis(1500),
        }
    }
}
