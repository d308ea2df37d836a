//! Collaborator services consumed by the engine: advisory locking, user
//! tokens, audit logging, webhooks and detached background work.

pub mod audit;
pub mod background;
pub mod callback;
pub mod lock;
pub mod token;
