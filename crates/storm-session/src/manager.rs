//! Thread-safe id → session registry.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::join_all;
use tracing::debug;

use crate::id::SessionId;
use crate::session::Session;

/// Concurrent map of live sessions, keyed by id.
///
/// Iteration works on snapshots, so holding the results of
/// [`SessionManager::snapshot`] never blocks concurrent inserts or
/// removals.
pub struct SessionManager<S: Session + ?Sized> {
    sessions: DashMap<SessionId, Arc<S>>,
}

impl<S: Session + ?Sized> SessionManager<S> {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Register a session. Fails (returning `false`) when the id is
    /// already present.
    pub fn try_add(&self, session: Arc<S>) -> bool {
        let id = session.id();
        match self.sessions.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(session);
                true
            }
        }
    }

    /// Remove and return a session.
    pub fn try_remove(&self, id: SessionId) -> Option<Arc<S>> {
        self.sessions.remove(&id).map(|(_, session)| session)
    }

    /// Look a session up by id.
    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<Arc<S>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Copy of the current session list.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<S>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Send `data` to every session except `exclude`, concurrently.
    ///
    /// Individual failures are logged and swallowed; one slow or dead
    /// session never blocks delivery to the others.
    pub async fn broadcast(&self, data: Bytes, exclude: Option<SessionId>) {
        let sends = self
            .snapshot()
            .into_iter()
            .filter(|session| Some(session.id()) != exclude)
            .map(|session| {
                let data = data.clone();
                async move {
                    if let Err(err) = session.send(data).await {
                        debug!(session = %session.id(), %err, "broadcast send failed");
                    }
                }
            });
        join_all(sends).await;
    }

    /// Close every session, swallowing per-session errors, then clear the
    /// registry.
    pub async fn close_all(&self) {
        let closes = self.snapshot().into_iter().map(|session| async move {
            if let Err(err) = session.close().await {
                debug!(session = %session.id(), %err, "close failed");
            }
        });
        join_all(closes).await;
        self.sessions.clear();
    }
}

impl<S: Session + ?Sized> Default for SessionManager<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Session + ?Sized> std::fmt::Debug for SessionManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("len", &self.len())
            .finish()
    }
}
