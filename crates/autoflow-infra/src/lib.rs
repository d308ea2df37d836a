//! Infrastructure layer for Autoflow.
//!
//! Contains implementations of the ports defined in `autoflow-core`:
//! SQLite storage (document store, advisory locks, audit log), local
//! filesystem object storage, HTTP webhooks and token service, and the
//! TOML configuration loader.

pub mod config;
pub mod http;
pub mod sqlite;
pub mod storage;
