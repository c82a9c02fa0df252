//! Process-wide session identifiers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of one session, unique for the lifetime of the process.
///
/// Ids start at 1, are strictly increasing, and are never reused. They do
/// not survive a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// The raw counter value.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocate the next session id.
#[must_use]
pub fn next_session_id() -> SessionId {
    SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
}

/// Reset the counter. Test support only; not part of the public contract.
#[doc(hidden)]
pub fn reset_session_ids() {
    NEXT_SESSION_ID.store(1, Ordering::Relaxed);
}
