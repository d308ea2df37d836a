//! SQLite storage layer.
//!
//! Store, lock and audit implementations backed by SQLite with WAL mode and
//! split read/write connection pools.

pub mod audit;
pub mod lock;
pub mod pool;
pub mod store;
