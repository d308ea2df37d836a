//! Success/error webhooks fired when a run stops.
//!
//! Delivery is best-effort: the helpers submit the POST on the background
//! task set and skip instances without a callback URL.

use std::sync::Arc;

use autoflow_types::callback::AsyncResponse;
use autoflow_types::error::PublicError;
use autoflow_types::instance::DagInstance;
use futures_util::future::BoxFuture;
use thiserror::Error;

use super::background::BackgroundTasks;

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("callback request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("callback to {url} returned status {status}")]
    Status { url: String, status: u16 },
}

/// Delivers webhook payloads. Implementations live in autoflow-infra.
pub trait CallbackSender: Send + Sync {
    fn send<'a>(
        &'a self,
        url: &'a str,
        body: &'a AsyncResponse,
    ) -> BoxFuture<'a, Result<(), CallbackError>>;
}

/// Sender used when no HTTP client is wired in; drops every payload.
#[derive(Debug, Default)]
pub struct NoopCallbackSender;

impl CallbackSender for NoopCallbackSender {
    fn send<'a>(
        &'a self,
        url: &'a str,
        _body: &'a AsyncResponse,
    ) -> BoxFuture<'a, Result<(), CallbackError>> {
        tracing::debug!(url, "no callback sender configured, payload dropped");
        Box::pin(async { Ok(()) })
    }
}

fn submit(
    background: &BackgroundTasks,
    sender: Arc<dyn CallbackSender>,
    url: String,
    body: AsyncResponse,
    name: &'static str,
) {
    background.spawn(name, async move {
        sender.send(&url, &body).await?;
        Ok(())
    });
}

/// Fire the success webhook of `ins` with the run's return value.
pub fn notify_success(
    background: &BackgroundTasks,
    sender: Arc<dyn CallbackSender>,
    ins: &DagInstance,
    data: serde_json::Value,
) {
    if ins.success_callback.is_empty() {
        return;
    }
    let body = AsyncResponse::completed(ins.id.clone(), data);
    submit(background, sender, ins.success_callback.clone(), body, "success_callback");
}

/// Fire the error webhook of `ins`.
pub fn notify_error(
    background: &BackgroundTasks,
    sender: Arc<dyn CallbackSender>,
    ins: &DagInstance,
    error: &PublicError,
) {
    if ins.error_callback.is_empty() {
        return;
    }
    let body = AsyncResponse::failed(ins.id.clone(), error);
    submit(background, sender, ins.error_callback.clone(), body, "error_callback");
}
