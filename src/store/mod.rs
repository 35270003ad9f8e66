//! Persistence layer — libSQL-backed storage for messages, deliveries and task runs.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    AppendOutcome, Database, DeliveryEvent, DeliveryStatus, TaskKind, TaskRun, TaskStatus,
};
