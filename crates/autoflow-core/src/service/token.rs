//! User access tokens handed to actions that call back into the platform.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use secrecy::SecretString;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token service not configured")]
    NotConfigured,

    #[error("token request for user '{user_id}' failed: {message}")]
    Request { user_id: String, message: String },
}

/// Access token issued for one user.
#[derive(Debug, Clone)]
pub struct Token {
    pub user_id: String,
    pub access_token: SecretString,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Token {
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}

/// Issues access tokens on behalf of a user.
///
/// Implementations live in autoflow-infra.
pub trait TokenProvider: Send + Sync {
    fn get_user_token<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<Token, TokenError>>;
}

/// Provider used when no token service is wired in. Every request fails.
#[derive(Debug, Default)]
pub struct NoTokenProvider;

impl TokenProvider for NoTokenProvider {
    fn get_user_token<'a>(&'a self, _user_id: &'a str) -> BoxFuture<'a, Result<Token, TokenError>> {
        Box::pin(async { Err(TokenError::NotConfigured) })
    }
}
