//! Upgrade context handed to the authorization hook.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Mutex;

use storm_wire::UpgradeRequest;

/// Errors from deciding an upgrade context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    /// `accept` or `reject` was called on an already decided context.
    AlreadyHandled,
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyHandled => write!(f, "upgrade context was already accepted or rejected"),
        }
    }
}

impl std::error::Error for ContextError {}

#[derive(Debug, Clone)]
struct Decision {
    handled: bool,
    accepted: bool,
    status: u16,
    reason: Option<String>,
}

/// A parsed upgrade request awaiting an accept/reject decision.
///
/// Handed to `on_connecting` subscribers before the 101 response is
/// written. A context may be decided exactly once; if no subscriber
/// decides it, the server auto-accepts.
pub struct WsUpgradeContext {
    path: String,
    query_string: Option<String>,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    key: String,
    remote_addr: Option<SocketAddr>,
    decision: Mutex<Decision>,
}

impl WsUpgradeContext {
    pub(crate) fn new(request: &UpgradeRequest, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            path: request.path.clone(),
            query_string: request.query_string.clone(),
            query: request.query(),
            headers: request.headers().clone(),
            key: request.key().unwrap_or_default().to_string(),
            remote_addr,
            decision: Mutex::new(Decision {
                handled: false,
                accepted: false,
                status: 403,
                reason: None,
            }),
        }
    }

    /// Request path without the query string.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw query string, if any.
    #[must_use]
    pub fn query_string(&self) -> Option<&str> {
        self.query_string.as_deref()
    }

    /// Query string split into key/value pairs.
    #[must_use]
    pub fn query(&self) -> &HashMap<String, String> {
        &self.query
    }

    /// Request headers with lowercased names.
    #[must_use]
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// The client's `Sec-WebSocket-Key`.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Remote peer address.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Accept the upgrade.
    pub fn accept(&self) -> Result<(), ContextError> {
        let mut decision = self.decision.lock().unwrap();
        if decision.handled {
            return Err(ContextError::AlreadyHandled);
        }
        decision.handled = true;
        decision.accepted = true;
        Ok(())
    }

    /// Reject the upgrade with an HTTP status and reason.
    pub fn reject(&self, status: u16, reason: impl Into<String>) -> Result<(), ContextError> {
        let mut decision = self.decision.lock().unwrap();
        if decision.handled {
            return Err(ContextError::AlreadyHandled);
        }
        decision.handled = true;
        decision.accepted = false;
        decision.status = status;
        decision.reason = Some(reason.into());
        Ok(())
    }

    /// Whether any subscriber decided this context.
    #[must_use]
    pub fn is_handled(&self) -> bool {
        self.decision.lock().unwrap().handled
    }

    /// Whether the context was explicitly accepted.
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        let decision = self.decision.lock().unwrap();
        decision.handled && decision.accepted
    }

    /// The rejection to answer with, when rejected.
    #[must_use]
    pub fn rejection(&self) -> Option<(u16, String)> {
        let decision = self.decision.lock().unwrap();
        if decision.handled && !decision.accepted {
            Some((
                decision.status,
                decision.reason.clone().unwrap_or_default(),
            ))
        } else {
            None
        }
    }
}

impl fmt::Debug for WsUpgradeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsUpgradeContext")
            .field("path", &self.path)
            .field("remote_addr", &self.remote_addr)
            .field("handled", &self.is_handled())
            .finish_non_exhaustive()
    }
}
