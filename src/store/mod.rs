//! Persistence layer — libSQL-backed storage for classified tasks.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::TaskRepository;
