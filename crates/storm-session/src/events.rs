//! Ordered event subscriber lists.
//!
//! Servers and clients expose their lifecycle as events; applications
//! subscribe async handlers before `start`/`connect`. Emission invokes
//! every handler in registration order, awaiting each one, which gives
//! multicast-delegate semantics with at-least-once delivery per
//! subscriber.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

type Handler<A> = Arc<dyn Fn(A) -> BoxFuture<'static, ()> + Send + Sync>;

/// Ordered list of async event handlers taking an argument of type `A`.
pub struct EventHandlers<A> {
    handlers: Vec<Handler<A>>,
}

impl<A: Clone + Send + 'static> EventHandlers<A> {
    /// Empty list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Register a handler. Handlers fire in registration order.
    pub fn subscribe<F, Fut>(&mut self, handler: F)
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers
            .push(Arc::new(move |args| handler(args).boxed()));
    }

    /// Whether anything is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Invoke every handler in order, awaiting each.
    pub async fn emit(&self, args: A) {
        for handler in &self.handlers {
            handler(args.clone()).await;
        }
    }
}

impl<A: Clone + Send + 'static> Default for EventHandlers<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> std::fmt::Debug for EventHandlers<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlers")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
