//! Pluggable business actions invoked by name from VM call instructions.
//!
//! An [`Action`] always implements `run`. Parameter decoding and the
//! before/after stages are optional capabilities, reported by presence
//! through [`Action::parameters`], [`Action::before`] and [`Action::after`].

pub mod context;
pub mod registry;

use autoflow_types::task::TaskInstanceStatus;
use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

pub use context::{ActionContext, TraceLog};
pub use registry::{ActionRegistry, ActionTarget};

/// Failure of one action stage. The message becomes the TaskInstance reason.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("{0}")]
    Failed(String),
}

impl ActionError {
    pub fn failed(message: impl Into<String>) -> Self {
        ActionError::Failed(message.into())
    }
}

/// Decodes the raw first call argument into the action's parameter value.
pub trait ParameterSpec: Send + Sync {
    fn decode(&self, raw: &Value) -> Result<Value, ActionError>;
}

/// Stage run before the action. Returns the status the task continues with;
/// returning `Blocked` suspends the VM once the call completes.
pub trait BeforeAction: Send + Sync {
    fn before<'a>(
        &'a self,
        ctx: &'a ActionContext<'a>,
        params: &'a Value,
    ) -> BoxFuture<'a, Result<TaskInstanceStatus, ActionError>>;
}

/// Stage run after the action, with the same parameters `run` received.
pub trait AfterAction: Send + Sync {
    fn after<'a>(
        &'a self,
        ctx: &'a ActionContext<'a>,
        params: &'a Value,
    ) -> BoxFuture<'a, Result<TaskInstanceStatus, ActionError>>;
}

/// A unit of business logic callable from a Dag.
pub trait Action: Send + Sync {
    fn run<'a>(
        &'a self,
        ctx: &'a ActionContext<'a>,
        params: Value,
    ) -> BoxFuture<'a, Result<Value, ActionError>>;

    fn parameters(&self) -> Option<&dyn ParameterSpec> {
        None
    }

    fn before(&self) -> Option<&dyn BeforeAction> {
        None
    }

    fn after(&self) -> Option<&dyn AfterAction> {
        None
    }
}

/// Parameter capability requiring a JSON object.
#[derive(Debug, Default)]
pub struct ObjectParameters;

impl ParameterSpec for ObjectParameters {
    fn decode(&self, raw: &Value) -> Result<Value, ActionError> {
        match raw {
            Value::Object(_) => Ok(raw.clone()),
            other => Err(ActionError::InvalidParameter(format!(
                "expected an object, got {other}"
            ))),
        }
    }
}
