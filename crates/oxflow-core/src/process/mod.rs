//! Process engine core: definition registry, run state machine, and durable
//! suspension.
//!
//! - `expr` -- typed expression AST for input mappings and conditions
//! - `context` -- per-run data plane with snapshot round-trip
//! - `registry` -- engine-owned definition registry, validated at register time
//! - `retry` -- backoff interval computation and attempt gate
//! - `executor` -- single-step execution with timeout and retry loop
//! - `engine` -- run state machine, overlap/idempotency, compensation
//! - `tasks` -- human task lifecycle and expiry sweep
//! - `scheduler` -- cron/interval polling with catch-up
//! - `handlers` -- service handler registry and channel transport seam
//! - `events` -- lifecycle event sink seam

pub mod context;
pub mod engine;
pub mod events;
pub mod executor;
pub mod expr;
pub mod handlers;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod tasks;
