//! Repository trait definitions (ports).
//!
//! These traits define the storage interfaces that the infrastructure layer
//! (autoflow-infra) implements. The core crate never depends on any
//! specific storage technology.

pub mod object_storage;
pub mod store;
