//! Infrastructure adapters for the oxflow engine.
//!
//! Implements the repository ports from `oxflow-core` over SQLite.

pub mod sqlite;
