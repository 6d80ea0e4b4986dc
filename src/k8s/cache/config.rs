/**
 * Configuration constants for the namespace watch coordinator
 */
use std::time::Duration;

/// Consecutive failed stream attempts before a resource type is given up on
pub const MAX_WATCH_RESTARTS: u32 = 50;

/// Maximum backoff time in seconds between restart attempts
pub const MAX_BACKOFF_SECONDS: u64 = 60;

/// Initial backoff time in seconds
pub const INITIAL_BACKOFF_SECONDS: u64 = 1;

/// Watch stream timeout in seconds (294 vs 300 to allow 6 seconds for graceful shutdown)
pub const WATCH_TIMEOUT_SECONDS: u32 = 294;

/// Brief delay before reopening a stream the server closed cleanly, in milliseconds
pub const RESTART_DELAY_MILLIS: u64 = 1000;

/// Timing policy for the watch handlers
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub max_restarts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub restart_delay: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            max_restarts: MAX_WATCH_RESTARTS,
            initial_backoff: Duration::from_secs(INITIAL_BACKOFF_SECONDS),
            max_backoff: Duration::from_secs(MAX_BACKOFF_SECONDS),
            restart_delay: Duration::from_millis(RESTART_DELAY_MILLIS),
        }
    }
}

impl WatchConfig {
    /// Next backoff after `current`, doubling up to the cap
    #[must_use]
    pub fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_backoff)
    }
}

/// Validate configuration constants at compile time
const _: () = {
    assert!(MAX_WATCH_RESTARTS > 0, "MAX_WATCH_RESTARTS must be greater than 0");
    assert!(MAX_BACKOFF_SECONDS > 0, "MAX_BACKOFF_SECONDS must be greater than 0");
    assert!(INITIAL_BACKOFF_SECONDS > 0, "INITIAL_BACKOFF_SECONDS must be greater than 0");
    assert!(
        INITIAL_BACKOFF_SECONDS <= MAX_BACKOFF_SECONDS,
        "INITIAL_BACKOFF_SECONDS must not exceed MAX_BACKOFF_SECONDS"
    );
    assert!(WATCH_TIMEOUT_SECONDS > 0, "WATCH_TIMEOUT_SECONDS must be greater than 0");
    assert!(RESTART_DELAY_MILLIS > 0, "RESTART_DELAY_MILLIS must be greater than 0");
};
