//! Service handler registry and channel transport seam.
//!
//! Services are registered as typed async functions under a stable name;
//! unknown names at execution time surface as a definition error rather
//! than a crash. The engine never inspects handler internals -- a handler's
//! return value becomes the step output and a handler's error is a
//! retryable step failure.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Service handlers
// ---------------------------------------------------------------------------

/// Failure raised by a service handler; retried per the step's policy.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ServiceError(pub String);

impl ServiceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

type HandlerFn =
    dyn Fn(Map<String, Value>) -> BoxFuture<'static, Result<Value, ServiceError>> + Send + Sync;

/// Name-keyed registry of service handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<DashMap<String, Arc<HandlerFn>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a handler under `name`.
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, ServiceError>> + Send + 'static,
    {
        let name = name.into();
        tracing::debug!(service = %name, "registered service handler");
        self.handlers
            .insert(name, Arc::new(move |inputs| Box::pin(handler(inputs))));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Look up a handler for invocation.
    pub fn get(&self, name: &str) -> Option<Arc<HandlerFn>> {
        self.handlers.get(name).map(|entry| entry.value().clone())
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Channel transport
// ---------------------------------------------------------------------------

/// Delivery failure from the channel transport; retryable.
#[derive(Debug, thiserror::Error)]
#[error("channel delivery failed: {0}")]
pub struct TransportError(pub String);

/// Outbound message seam used by SEND steps. Implementations own the actual
/// delivery (email, chat, webhook, ...); the engine only hands over the
/// rendered message and mapped payload.
pub trait ChannelTransport: Send + Sync {
    fn send<'a>(
        &'a self,
        channel: &'a str,
        message: &'a str,
        payload: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<(), TransportError>>;
}

/// Transport that logs and discards. Default for engines that never SEND.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTransport;

impl ChannelTransport for NoopTransport {
    fn send<'a>(
        &'a self,
        channel: &'a str,
        message: &'a str,
        _payload: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            tracing::debug!(channel, message, "noop transport dropped message");
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
