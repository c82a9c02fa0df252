//! Client reconnect policy.

use std::time::Duration;

/// Automatic reconnection settings for clients.
///
/// When enabled, the client wraps connect-and-run in a supervisor loop:
/// after a connection ends (for any reason other than cancellation) it
/// waits [`delay`](Self::delay) and dials again. The attempt counter
/// resets on every successful connect.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectOptions {
    /// Whether to reconnect at all.
    pub enabled: bool,
    /// Fixed pause between attempts.
    pub delay: Duration,
    /// Give up after this many consecutive failed attempts; zero retries
    /// forever.
    pub max_attempts: u32,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            delay: Duration::from_secs(2),
            max_attempts: 0,
        }
    }
}

/// Event payload fired before each reconnection attempt.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectAttempt {
    /// 1-based attempt number since the last successful connect.
    pub attempt: u32,
    /// Pause taken before this attempt.
    pub delay: Duration,
}
