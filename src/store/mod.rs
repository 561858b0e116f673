//! Persistence layer: channel cursors and the decision audit log.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{AuditRecord, Cursor, ModerationStore};
