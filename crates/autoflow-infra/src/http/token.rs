//! User token providers.
//!
//! [`HttpTokenProvider`] asks a token service for a per-user access token
//! and caches it until shortly before it expires. [`StaticTokenProvider`]
//! hands out one configured token to every user.

use std::time::Duration;

use autoflow_core::service::token::{Token, TokenError, TokenProvider};
use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

/// Tokens this close to expiry are fetched again.
const REFRESH_MARGIN_SECS: i64 = 30;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Token service client with a per-user cache.
///
/// Requests `GET {endpoint}/users/{user_id}/token`, authenticated with the
/// service credential when one is configured.
pub struct HttpTokenProvider {
    client: reqwest::Client,
    endpoint: String,
    credential: Option<SecretString>,
    cache: DashMap<String, Token>,
}

impl HttpTokenProvider {
    pub fn new(
        endpoint: impl Into<String>,
        credential: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            credential,
            cache: DashMap::new(),
        })
    }

    fn cached(&self, user_id: &str) -> Option<Token> {
        let token = self.cache.get(user_id)?;
        let fresh = token
            .expires_at
            .is_none_or(|at| at - chrono::Duration::seconds(REFRESH_MARGIN_SECS) > Utc::now());
        fresh.then(|| token.clone())
    }

    async fn fetch(&self, user_id: &str) -> Result<Token, TokenError> {
        if let Some(token) = self.cached(user_id) {
            return Ok(token);
        }

        let request_error = |message: String| TokenError::Request {
            user_id: user_id.to_string(),
            message,
        };

        let url = format!("{}/users/{user_id}/token", self.endpoint);
        let mut request = self.client.get(&url);
        if let Some(credential) = &self.credential {
            request = request.bearer_auth(credential.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| request_error(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(request_error(format!("token service returned status {status}")));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| request_error(format!("invalid token response: {e}")))?;

        let token = Token {
            user_id: user_id.to_string(),
            access_token: SecretString::from(body.access_token),
            expires_at: body
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        };
        tracing::debug!(user_id, "user token issued");
        self.cache.insert(user_id.to_string(), token.clone());
        Ok(token)
    }
}

impl TokenProvider for HttpTokenProvider {
    fn get_user_token<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<Token, TokenError>> {
        Box::pin(self.fetch(user_id))
    }
}

/// Hands the same non-expiring token to every user.
pub struct StaticTokenProvider {
    token: SecretString,
}

impl StaticTokenProvider {
    pub fn new(token: SecretString) -> Self {
        Self { token }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn get_user_token<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<Token, TokenError>> {
        let token = Token {
            user_id: user_id.to_string(),
            access_token: self.token.clone(),
            expires_at: None,
        };
        Box::pin(async move { Ok(token) })
    }
}
