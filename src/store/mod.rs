//! Persistence layer: libSQL-backed storage for tasks, agents and updates.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, ReclaimedAgent};
