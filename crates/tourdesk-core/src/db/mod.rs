//! Database layer for tourdesk

mod connection;
mod entity_repository;
mod migrations;
mod sync_log_repository;

pub use connection::Database;
pub use entity_repository::{EntityRepository, LibSqlEntityRepository};
pub use sync_log_repository::SyncLogRepository;
