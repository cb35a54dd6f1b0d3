//! Lifecycle event sink seam.
//!
//! Definitions declare event names for start/complete/failure; the engine
//! emits them to an external sink and never interprets subscribers.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use uuid::Uuid;

/// An emitted lifecycle event: name + run id + timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub name: String,
    pub run_id: Uuid,
    pub definition: String,
    pub timestamp: DateTime<Utc>,
}

/// Destination for lifecycle events.
pub trait EventSink: Send + Sync {
    fn emit<'a>(&'a self, event: LifecycleEvent) -> BoxFuture<'a, ()>;
}

/// Sink that discards events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit<'a>(&'a self, _event: LifecycleEvent) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }
}

/// Sink that logs each event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit<'a>(&'a self, event: LifecycleEvent) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tracing::info!(
                event = %event.name,
                run_id = %event.run_id,
                definition = %event.definition,
                "lifecycle event"
            );
        })
    }
}
