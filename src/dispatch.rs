//! Dispatch router: event-type keyed handler table
//!
//! Handlers are registered per event type and looked up by exact match.
//! An envelope with no registered handler is expected (new event types
//! can appear before consumers learn them) and is ignored silently.
//! Handler errors and panics are contained here and never reach the
//! consume loop.

use crate::error::{ConsumerError, Result};
use crate::types::{DeliveryContext, Envelope};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Handler for one event type
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process a decoded envelope
    ///
    /// Returning an error leaves the delivery unacknowledged so the broker
    /// can redeliver it (manual-ack mode only).
    async fn handle(&self, envelope: &Envelope, ctx: &DeliveryContext) -> Result<()>;
}

/// Adapter turning a closure into an [`EventHandler`]
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a handler
///
/// ```rust
/// use univer_event_consumer::dispatch::{handler_fn, Router};
///
/// let router = Router::new().on(
///     "changeset",
///     handler_fn(|env, _ctx| {
///         let id = env.event_id.clone();
///         Box::pin(async move {
///             println!("got {}", id);
///             Ok(())
///         })
///     }),
/// );
/// assert!(router.handles("changeset"));
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: for<'a> Fn(&'a Envelope, &'a DeliveryContext) -> BoxFuture<'a, Result<()>> + Send + Sync,
{
    FnHandler { f }
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: for<'a> Fn(&'a Envelope, &'a DeliveryContext) -> BoxFuture<'a, Result<()>> + Send + Sync,
{
    async fn handle(&self, envelope: &Envelope, ctx: &DeliveryContext) -> Result<()> {
        (self.f)(envelope, ctx).await
    }
}

/// Result of dispatching one envelope
#[derive(Debug)]
pub enum DispatchOutcome {
    /// A handler ran and succeeded
    Handled,
    /// No handler is registered for the event type
    Ignored,
    /// The handler failed or panicked
    Failed(ConsumerError),
}

impl DispatchOutcome {
    /// Whether the delivery may be acknowledged
    pub fn is_success(&self) -> bool {
        !matches!(self, DispatchOutcome::Failed(_))
    }
}

/// Registered handler table
#[derive(Clone, Default)]
pub struct Router {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type`, replacing any previous one
    pub fn on(mut self, event_type: impl Into<String>, handler: impl EventHandler + 'static) -> Self {
        self.register(event_type, Arc::new(handler));
        self
    }

    /// Register a shared handler
    pub fn register(&mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(event_type.into(), handler);
    }

    /// Whether a handler is registered for `event_type`
    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Registered event types, sorted
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Invoke the handler registered for the envelope's event type
    pub async fn dispatch(&self, envelope: &Envelope, ctx: &DeliveryContext) -> DispatchOutcome {
        let Some(handler) = self.handlers.get(&envelope.event_type) else {
            tracing::trace!(
                event_id = %envelope.event_id,
                event_type = %envelope.event_type,
                "No handler registered, ignoring"
            );
            return DispatchOutcome::Ignored;
        };

        let result = AssertUnwindSafe(handler.handle(envelope, ctx))
            .catch_unwind()
            .await;

        let err = match result {
            Ok(Ok(())) => return DispatchOutcome::Handled,
            Ok(Err(e)) => e,
            Err(panic) => ConsumerError::Handler(format!("handler panicked: {}", panic_message(&*panic))),
        };

        tracing::warn!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            trace_id = ctx.trace_id.as_deref().unwrap_or(""),
            error = %err,
            "Event handler failed"
        );
        DispatchOutcome::Failed(err)
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("event_types", &self.event_types())
            .finish()
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
