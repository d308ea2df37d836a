//! Webhook delivery over HTTP.
//!
//! Implements `CallbackSender` from `autoflow-core`: the `AsyncResponse`
//! payload is POSTed as JSON and any non-2xx answer counts as a failure.

use std::time::Duration;

use autoflow_core::service::callback::{CallbackError, CallbackSender};
use autoflow_types::callback::AsyncResponse;
use futures_util::future::BoxFuture;

/// reqwest-backed webhook sender.
pub struct HttpCallbackSender {
    client: reqwest::Client,
}

impl HttpCallbackSender {
    /// Create a sender whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    async fn post(&self, url: &str, body: &AsyncResponse) -> Result<(), CallbackError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| CallbackError::Request {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CallbackError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        tracing::debug!(url, task_id = %body.task_id, "callback delivered");
        Ok(())
    }
}

impl CallbackSender for HttpCallbackSender {
    fn send<'a>(
        &'a self,
        url: &'a str,
        body: &'a AsyncResponse,
    ) -> BoxFuture<'a, Result<(), CallbackError>> {
        Box::pin(self.post(url, body))
    }
}
