//! Per-call execution context handed to actions.

use std::sync::{Mutex, PoisonError};

use autoflow_types::instance::DagInstance;
use autoflow_types::share_data::ShareData;
use autoflow_types::task::{TaskInstance, TaskTrace};
use serde_json::Value;

use super::registry::ActionTarget;
use crate::service::token::Token;
use crate::vm::CallFrame;

/// Traces recorded during one call, flushed onto the TaskInstance with the
/// call's final patch.
#[derive(Debug, Default)]
pub struct TraceLog {
    entries: Mutex<Vec<TaskTrace>>,
}

impl TraceLog {
    pub fn push(&self, trace: TaskTrace) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(trace);
    }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<TaskTrace> {
        std::mem::take(&mut *self.entries.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Everything an action may read while it runs.
///
/// Borrowed for exactly one call: the in-flight TaskInstance and token are
/// not reachable once the call returns.
pub struct ActionContext<'a> {
    dag_ins: &'a DagInstance,
    task: &'a TaskInstance,
    frame: &'a CallFrame,
    target: &'a ActionTarget,
    token: Option<&'a Token>,
    traces: &'a TraceLog,
}

impl<'a> ActionContext<'a> {
    pub fn new(
        dag_ins: &'a DagInstance,
        task: &'a TaskInstance,
        frame: &'a CallFrame,
        target: &'a ActionTarget,
        token: Option<&'a Token>,
        traces: &'a TraceLog,
    ) -> Self {
        Self {
            dag_ins,
            task,
            frame,
            target,
            token,
            traces,
        }
    }

    pub fn dag_ins_id(&self) -> &str {
        &self.dag_ins.id
    }

    pub fn dag_id(&self) -> &str {
        &self.dag_ins.dag_id
    }

    pub fn user_id(&self) -> &str {
        &self.dag_ins.user_id
    }

    pub fn vars_get(&self, key: &str) -> Option<&str> {
        self.dag_ins.vars_get(key)
    }

    /// Substitute `{{var}}` placeholders in `params`.
    pub fn render(&self, params: &Value) -> Value {
        self.dag_ins.render(params)
    }

    pub fn share_data(&self) -> &ShareData {
        &self.dag_ins.share_data
    }

    /// The TaskInstance recording this call.
    pub fn task(&self) -> &TaskInstance {
        self.task
    }

    pub fn frame(&self) -> &CallFrame {
        self.frame
    }

    pub fn target(&self) -> &ActionTarget {
        self.target
    }

    /// User token, present only for allow-listed actions.
    pub fn token(&self) -> Option<&Token> {
        self.token
    }

    pub fn is_debug(&self) -> bool {
        self.dag_ins.is_debug()
    }

    /// Record a progress message against the running task. It is stored on
    /// the TaskInstance when the call finishes, whether it succeeds or fails.
    pub fn trace(&self, message: impl Into<String>) {
        let trace = TaskTrace::new(message);
        tracing::info!(
            dag_ins_id = %self.dag_ins.id,
            task_ins_id = %self.task.id,
            task_id = %self.frame.label,
            action = %self.task.action_name,
            "{}",
            trace.message
        );
        self.traces.push(trace);
    }
}
