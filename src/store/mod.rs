//! Persistence layer: append-only record log and vector store.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, Record, RecordFilter, RecordKind};
