//! External action dispatch for VM call instructions.
//!
//! Every call becomes one TaskInstance. Stages run in order (before, token,
//! run, after) and the first failing stage marks the task Failed with its
//! message and ends the call.

use autoflow_types::error::RepositoryError;
use autoflow_types::instance::DagInstance;
use autoflow_types::task::{TaskInstance, TaskInstancePatch, TaskInstanceStatus};
use serde_json::Value;
use thiserror::Error;

use super::{CallFrame, CallOutcome};
use crate::action::registry::{CUSTOM_PREFIX, OPERATOR_PREFIX};
use crate::action::{Action, ActionContext, ActionError, ActionTarget, TraceLog};
use crate::engine::Engine;
use crate::repository::store::Store;
use crate::service::token::{Token, TokenError};

/// Prefix of platform file actions that always receive a user token.
const ANYSHARE_PREFIX: &str = "@anyshare";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("func {0} not found")]
    NotFound(String),

    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("call {0} failed, missing parameter")]
    MissingParameter(String),

    #[error("call {0} failed, invalid parameter")]
    InvalidParameter(String),

    #[error(transparent)]
    Action(#[from] ActionError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Resolves call names against the engine's registry and runs them for one
/// DagInstance.
pub struct ActionDispatcher<'a, S: Store> {
    engine: &'a Engine<S>,
    dag_ins: &'a DagInstance,
}

impl<'a, S: Store> ActionDispatcher<'a, S> {
    pub fn new(engine: &'a Engine<S>, dag_ins: &'a DagInstance) -> Self {
        Self { engine, dag_ins }
    }

    /// Run the action called `name` with positional `args`.
    ///
    /// Returns `wait = true` when a before/after stage left the task
    /// Blocked; the VM is expected to suspend.
    pub async fn call(
        &self,
        frame: &CallFrame,
        name: &str,
        args: Vec<Value>,
    ) -> Result<CallOutcome, DispatchError> {
        let (target, action) = self.engine.actions().resolve(name)?;
        let params = prepare_params(name, &target, action.as_ref(), &args)?;

        let mut task = TaskInstance::new(
            self.dag_ins.id.clone(),
            frame.label.clone(),
            frame.title.clone(),
            name,
            TaskInstanceStatus::Running,
        );
        task.params = args.first().filter(|v| v.is_object()).cloned();
        self.engine
            .store()
            .batch_create_task_ins(std::slice::from_ref(&task))
            .await?;

        tracing::debug!(
            dag_ins_id = %self.dag_ins.id,
            task_ins_id = %task.id,
            action = name,
            "dispatching action"
        );

        let traces = TraceLog::default();
        let mut status = TaskInstanceStatus::Running;

        if let Some(before) = action.before() {
            let ctx = ActionContext::new(self.dag_ins, &task, frame, &target, None, &traces);
            match before.before(&ctx, &params).await {
                Ok(next) => status = next,
                Err(e) => return Err(self.fail_task(&task, e.into(), &traces).await),
            }
        }

        let token = match self.token_for(name).await {
            Ok(token) => token,
            Err(e) => return Err(self.fail_task(&task, e.into(), &traces).await),
        };

        let ctx = ActionContext::new(self.dag_ins, &task, frame, &target, token.as_ref(), &traces);
        let after = action.after();
        let after_params = after.map(|_| params.clone());
        let result = match action.run(&ctx, params).await {
            Ok(result) => result,
            Err(e) => return Err(self.fail_task(&task, e.into(), &traces).await),
        };

        if let (Some(after), Some(params)) = (after, &after_params) {
            match after.after(&ctx, params).await {
                Ok(next) => status = next,
                Err(e) => return Err(self.fail_task(&task, e.into(), &traces).await),
            }
        }

        let wait = status == TaskInstanceStatus::Blocked;
        let patch = TaskInstancePatch {
            status: Some(if wait {
                TaskInstanceStatus::Blocked
            } else {
                TaskInstanceStatus::Success
            }),
            results: Some(result.clone()),
            traces: traces.take(),
            ..TaskInstancePatch::new(task.id.clone())
        };
        self.engine.store().patch_task_ins(&patch).await?;

        Ok(CallOutcome {
            wait,
            results: vec![result],
        })
    }

    /// Mark `task` Failed with the error text and flush its traces. A failing
    /// patch is logged; the stage error is what the caller sees.
    async fn fail_task(
        &self,
        task: &TaskInstance,
        err: DispatchError,
        traces: &TraceLog,
    ) -> DispatchError {
        tracing::warn!(
            dag_ins_id = %self.dag_ins.id,
            task_ins_id = %task.id,
            action = %task.action_name,
            error = %err,
            "action failed"
        );
        let patch = TaskInstancePatch {
            traces: traces.take(),
            ..TaskInstancePatch::failed(task.id.clone(), err.to_string())
        };
        if let Err(e) = self.engine.store().patch_task_ins(&patch).await {
            tracing::warn!(task_ins_id = %task.id, error = %e, "failed to record task failure");
        }
        err
    }

    async fn token_for(&self, name: &str) -> Result<Option<Token>, TokenError> {
        if !needs_token(name, &self.engine.config().token_action_names) {
            return Ok(None);
        }
        let token = self
            .engine
            .tokens()
            .get_user_token(&self.dag_ins.user_id)
            .await?;
        Ok(Some(token))
    }
}

/// Whether `name` runs with the acting user's token.
pub fn needs_token(name: &str, allow_list: &[String]) -> bool {
    name.starts_with(ANYSHARE_PREFIX)
        || name.starts_with(CUSTOM_PREFIX.trim_end_matches('/'))
        || name.starts_with(OPERATOR_PREFIX.trim_end_matches('/'))
        || allow_list.iter().any(|n| n == name)
}

fn prepare_params(
    name: &str,
    target: &ActionTarget,
    action: &dyn Action,
    args: &[Value],
) -> Result<Value, DispatchError> {
    let missing = || DispatchError::MissingParameter(name.to_string());
    let invalid = || DispatchError::InvalidParameter(name.to_string());

    match target {
        ActionTarget::Registered { .. } => match action.parameters() {
            Some(spec) => {
                let raw = args.first().ok_or_else(missing)?;
                spec.decode(raw).map_err(|_| invalid())
            }
            None => Ok(args.first().cloned().unwrap_or(Value::Null)),
        },
        ActionTarget::Custom { .. } => Ok(args
            .first()
            .filter(|v| v.is_object())
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()))),
        ActionTarget::Operator { .. } | ActionTarget::TriggerOperator { .. } => {
            let raw = args.first().ok_or_else(missing)?;
            if !raw.is_object() {
                return Err(invalid());
            }
            match action.parameters() {
                Some(spec) => spec.decode(raw).map_err(|_| invalid()),
                None => Ok(raw.clone()),
            }
        }
    }
}
