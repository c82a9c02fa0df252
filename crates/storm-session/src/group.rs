//! Named session groups for targeted broadcast.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::join_all;
use tracing::debug;

use crate::id::SessionId;
use crate::session::Session;

/// Registry of named groups, each a set of sessions.
///
/// Membership is mirrored into each session's own group set, and groups
/// disappear as soon as their last member leaves.
pub struct SessionGroup<S: Session + ?Sized> {
    groups: DashMap<String, HashMap<SessionId, Arc<S>>>,
}

impl<S: Session + ?Sized> SessionGroup<S> {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            groups: DashMap::new(),
        }
    }

    /// Add a session to a group, creating the group if needed.
    pub fn join(&self, name: &str, session: &Arc<S>) {
        self.groups
            .entry(name.to_string())
            .or_default()
            .insert(session.id(), session.clone());
        session.core().add_group(name);
    }

    /// Remove a session from a group. The group is deleted when it
    /// becomes empty.
    pub fn leave(&self, name: &str, session: &Arc<S>) {
        session.core().remove_group(name);
        let emptied = match self.groups.get_mut(name) {
            Some(mut members) => {
                members.remove(&session.id());
                members.is_empty()
            }
            None => false,
        };
        if emptied {
            // Re-checked under the map lock: a concurrent join wins.
            self.groups.remove_if(name, |_, members| members.is_empty());
        }
    }

    /// Remove a session from every group it belongs to (used when the
    /// session disconnects).
    pub fn remove_from_all(&self, session: &Arc<S>) {
        for name in session.core().groups() {
            self.leave(&name, session);
        }
    }

    /// Send `data` to every member of `name` except `exclude`,
    /// concurrently. A missing group is a no-op. Per-session errors are
    /// logged and swallowed.
    pub async fn broadcast(&self, name: &str, data: Bytes, exclude: Option<SessionId>) {
        let members: Vec<Arc<S>> = match self.groups.get(name) {
            Some(members) => members.values().cloned().collect(),
            None => return,
        };
        let sends = members
            .into_iter()
            .filter(|session| Some(session.id()) != exclude)
            .map(|session| {
                let data = data.clone();
                async move {
                    if let Err(err) = session.send(data).await {
                        debug!(session = %session.id(), %err, "group broadcast send failed");
                    }
                }
            });
        join_all(sends).await;
    }

    /// Number of members of `name`; zero when the group does not exist.
    #[must_use]
    pub fn member_count(&self, name: &str) -> usize {
        self.groups
            .get(name)
            .map(|members| members.len())
            .unwrap_or(0)
    }

    /// Names of all non-empty groups.
    #[must_use]
    pub fn group_names(&self) -> Vec<String> {
        self.groups.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl<S: Session + ?Sized> Default for SessionGroup<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Session + ?Sized> std::fmt::Debug for SessionGroup<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGroup")
            .field("groups", &self.groups.len())
            .finish()
    }
}
