//! Engine logic and collaborator trait definitions for Autoflow.
//!
//! This crate defines the "ports" (store, object storage, lock, token,
//! audit and callback traits) that the infrastructure layer implements, and
//! the engine built on top of them: action dispatch, lifecycle hooks, the
//! ExtData offloader and the VM extension that boots and persists runs.
//! It depends only on `autoflow-types` -- never on `autoflow-infra` or any
//! database/IO crate.

pub mod action;
pub mod engine;
pub mod ext_data;
pub mod repository;
pub mod service;
pub mod vm;

#[cfg(test)]
pub(crate) mod testing;
