//! HTTP adapters: webhook delivery and the user token service.

pub mod callback;
pub mod token;

#[cfg(test)]
pub(crate) mod mock;
