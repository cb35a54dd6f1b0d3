//! Observability for the oxflow engine: tracing subscriber setup.

pub mod tracing_setup;

pub use tracing_setup::init_tracing;
