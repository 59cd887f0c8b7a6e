//! Persistence layer: libSQL-backed storage for requests, logs and jobs.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{ActivityLogEntry, LogKind, RunStore};
