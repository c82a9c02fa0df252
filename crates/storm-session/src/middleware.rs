//! Middleware pipeline: ordered interception of session lifecycle and
//! data flow.
//!
//! Middleware registers on a server before `start` and sees every
//! connection. The receive and send stages may transform the payload or
//! drop it entirely by returning `None`; the disconnect stage runs in
//! reverse registration order, mirroring stack unwinding.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;

use crate::session::{Session, SessionError};

/// Outbound filter a server installs on its sessions so user sends run
/// the pipeline's send stage. `None` drops the payload.
pub type SendFilter = Arc<dyn Fn(Bytes) -> BoxFuture<'static, Option<Bytes>> + Send + Sync>;

/// One interception stage. Implement any subset; the defaults pass
/// everything through untouched.
#[async_trait]
pub trait Middleware<S: Session + ?Sized>: Send + Sync {
    /// A session finished its handshake and is registered.
    async fn on_connected(&self, _session: &Arc<S>) {}

    /// A payload arrived. Return the (possibly transformed) payload to
    /// keep it flowing, or `None` to drop it before it reaches later
    /// stages and the application.
    async fn on_data_received(&self, _session: &Arc<S>, data: Bytes) -> Option<Bytes> {
        Some(data)
    }

    /// A payload is about to be sent. Return `None` to drop the send.
    async fn on_data_sending(&self, _session: &Arc<S>, data: Bytes) -> Option<Bytes> {
        Some(data)
    }

    /// A session is going away. Stages run in reverse registration order.
    async fn on_disconnected(&self, _session: &Arc<S>) {}

    /// An error surfaced on the session's connection.
    async fn on_error(&self, _session: &Arc<S>, _error: &SessionError) {}
}

/// Ordered list of middleware stages.
///
/// Immutable once the owning server has started; registration happens
/// through the builder-style [`MiddlewarePipeline::with`].
pub struct MiddlewarePipeline<S: Session + ?Sized> {
    stages: Vec<Arc<dyn Middleware<S>>>,
}

impl<S: Session + ?Sized> MiddlewarePipeline<S> {
    /// Empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Append a stage. Stages run in registration order (except
    /// disconnect, which unwinds).
    #[must_use]
    pub fn with<M: Middleware<S> + 'static>(mut self, stage: M) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Append an already shared stage.
    #[must_use]
    pub fn with_arc(mut self, stage: Arc<dyn Middleware<S>>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the pipeline has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run the connect stage, forward order.
    pub async fn connected(&self, session: &Arc<S>) {
        for stage in &self.stages {
            stage.on_connected(session).await;
        }
    }

    /// Run the receive stage, forward order. `None` means some stage
    /// dropped the payload.
    pub async fn data_received(&self, session: &Arc<S>, data: Bytes) -> Option<Bytes> {
        let mut data = data;
        for stage in &self.stages {
            data = stage.on_data_received(session, data).await?;
        }
        Some(data)
    }

    /// Run the send stage, forward order. `None` means some stage dropped
    /// the send.
    pub async fn data_sending(&self, session: &Arc<S>, data: Bytes) -> Option<Bytes> {
        let mut data = data;
        for stage in &self.stages {
            data = stage.on_data_sending(session, data).await?;
        }
        Some(data)
    }

    /// Run the disconnect stage in reverse registration order.
    pub async fn disconnected(&self, session: &Arc<S>) {
        for stage in self.stages.iter().rev() {
            stage.on_disconnected(session).await;
        }
    }

    /// Run the error stage, forward order.
    pub async fn error(&self, session: &Arc<S>, error: &SessionError) {
        for stage in &self.stages {
            stage.on_error(session, error).await;
        }
    }
}

impl<S: Session + ?Sized> Default for MiddlewarePipeline<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Session + ?Sized> Clone for MiddlewarePipeline<S> {
    fn clone(&self) -> Self {
        Self {
            stages: self.stages.clone(),
        }
    }
}

impl<S: Session + ?Sized> std::fmt::Debug for MiddlewarePipeline<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewarePipeline")
            .field("stages", &self.stages.len())
            .finish()
    }
}
