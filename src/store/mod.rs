//! Persistence layer: libSQL-backed storage for policies, tracking, and the ledger.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
