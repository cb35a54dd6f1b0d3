//! Process execution engine and repository trait definitions for oxflow.
//!
//! This crate defines the "ports" (repository traits) that the
//! infrastructure layer implements, plus the engine itself. It depends only
//! on `oxflow-types` -- never on `oxflow-infra` or any database crate.

pub mod process;
pub mod repository;
