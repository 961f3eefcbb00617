// vidforge Infrastructure - SQLite Adapter
// Implements: JobStore

mod connection;
mod job_store;
mod migration;

pub use connection::create_pool;
pub use job_store::SqliteJobStore;
pub use migration::run_migrations;

// Note: sqlx::Error is converted through map_sqlx_error because of the
// orphan rules (no From<sqlx::Error> for AppError outside core)
