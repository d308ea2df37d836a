//! Shared domain types for Autoflow.
//!
//! This crate contains the domain model of the workflow engine: Dag
//! definitions, DagInstance run records, the ShareData scope, TaskInstance
//! audit rows, ExtData offload descriptors and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror, regex.

pub mod audit;
pub mod callback;
pub mod config;
pub mod dag;
pub mod error;
pub mod ext_data;
pub mod instance;
pub mod share_data;
pub mod task;

/// Generate a new time-sortable identifier for persisted records.
pub fn new_id() -> String {
    uuid::Uuid::now_v7().to_string()
}
