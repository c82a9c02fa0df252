//! Session model for stormsocket.
//!
//! A session is one live endpoint over one transport: it has an identity,
//! metrics, a slow-consumer policy, and group memberships. This crate
//! defines the [`Session`] trait the TCP and WebSocket session types
//! implement, plus the machinery around sessions that is the same for
//! every protocol: the [`SessionManager`] registry, named
//! [`SessionGroup`]s for targeted broadcast, the [`Middleware`] pipeline,
//! and ordered [`EventHandlers`] subscriber lists.

#![deny(unsafe_code)]

mod events;
mod group;
mod id;
mod manager;
mod middleware;
mod session;

pub use events::EventHandlers;
pub use group::SessionGroup;
pub use id::{next_session_id, SessionId};
pub use manager::SessionManager;
pub use middleware::{Middleware, MiddlewarePipeline, SendFilter};
pub use session::{
    MetricsSnapshot, Session, SessionCore, SessionError, SessionMetrics, SessionState,
    SlowConsumerPolicy,
};

#[doc(hidden)]
pub use id::reset_session_ids;
