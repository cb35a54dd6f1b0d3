//! SQLite persistence: split read/write pools plus the process repository.

pub mod pool;
pub mod process;

pub use pool::{DatabasePool, default_database_url};
pub use process::SqliteProcessRepository;
