//! Shared domain types for the oxflow process engine.
//!
//! This crate contains the declarative process/schedule definitions, the
//! mutable run/task records the engine persists, and the shared repository
//! error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod error;
pub mod process;
