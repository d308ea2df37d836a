//! Lifecycle hooks: VM events that leave a TaskInstance trail.
//!
//! Hooks never fail the run. A store error while recording a hook is only
//! logged.

use autoflow_types::instance::DagInstance;
use autoflow_types::task::{TaskInstance, TaskInstanceStatus};
use serde_json::{Value, json};

use super::CallFrame;
use crate::engine::Engine;
use crate::repository::store::Store;

pub const ASSIGN_ACTION: &str = "@internal/assign";
pub const BRANCHES_ACTION: &str = "@control/flow/branches";
pub const LOOP_ACTION: &str = "@control/flow/loop";
pub const RETURN_ACTION: &str = "@internal/return";

pub struct LifecycleHooks<'a, S: Store> {
    engine: &'a Engine<S>,
    dag_ins: &'a DagInstance,
}

impl<'a, S: Store> LifecycleHooks<'a, S> {
    pub fn new(engine: &'a Engine<S>, dag_ins: &'a DagInstance) -> Self {
        Self { engine, dag_ins }
    }

    /// A variable assignment is about to happen.
    pub async fn before_assign(&self, frame: &CallFrame, target: &str, value: &Value) {
        let task = self
            .task(frame, ASSIGN_ACTION, TaskInstanceStatus::Success)
            .with_params(json!({ "target": target, "value": value }));
        self.record(task).await;
    }

    /// A branch was evaluated as not taken.
    pub async fn branch_skip(&self, frame: &CallFrame) {
        self.record(self.task(frame, BRANCHES_ACTION, TaskInstanceStatus::Skipped))
            .await;
    }

    /// A branch was entered.
    pub async fn branch_start(&self, frame: &CallFrame) {
        self.record(self.task(frame, BRANCHES_ACTION, TaskInstanceStatus::Success))
            .await;
    }

    pub async fn loop_start(&self, frame: &CallFrame, value: &Value) {
        let task = self
            .task(frame, LOOP_ACTION, TaskInstanceStatus::Success)
            .with_results(value.clone());
        self.record(task).await;
    }

    pub async fn before_return(&self, frame: &CallFrame, value: &Value) {
        let task = self
            .task(frame, RETURN_ACTION, TaskInstanceStatus::Success)
            .with_results(value.clone());
        self.record(task).await;
    }

    fn task(&self, frame: &CallFrame, action: &str, status: TaskInstanceStatus) -> TaskInstance {
        TaskInstance::new(
            self.dag_ins.id.clone(),
            frame.label.clone(),
            frame.title.clone(),
            action,
            status,
        )
    }

    async fn record(&self, task: TaskInstance) {
        if let Err(e) = self
            .engine
            .store()
            .batch_create_task_ins(std::slice::from_ref(&task))
            .await
        {
            tracing::warn!(
                dag_ins_id = %self.dag_ins.id,
                task_id = %task.task_id,
                action = %task.action_name,
                error = %e,
                "failed to record lifecycle hook"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestEnv;
    use autoflow_types::dag::Trigger;

    #[tokio::test]
    async fn hooks_record_one_task_each() {
        let env = TestEnv::new();
        let ins = DagInstance::new("dag-1", Trigger::Manually);
        let hooks = LifecycleHooks::new(&env.engine, &ins);
        let frame = CallFrame::new("step-2", "Check size");

        hooks.before_assign(&frame, "size", &json!(42)).await;
        hooks.branch_skip(&frame).await;
        hooks.branch_start(&frame).await;
        hooks.loop_start(&frame, &json!([1, 2])).await;
        hooks.before_return(&frame, &json!("done")).await;

        let tasks = env.store.tasks(&ins.id);
        let summary: Vec<(&str, TaskInstanceStatus)> = tasks
            .iter()
            .map(|t| (t.action_name.as_str(), t.status))
            .collect();
        assert_eq!(
            summary,
            vec![
                (ASSIGN_ACTION, TaskInstanceStatus::Success),
                (BRANCHES_ACTION, TaskInstanceStatus::Skipped),
                (BRANCHES_ACTION, TaskInstanceStatus::Success),
                (LOOP_ACTION, TaskInstanceStatus::Success),
                (RETURN_ACTION, TaskInstanceStatus::Success),
            ]
        );
        assert_eq!(tasks[0].params, Some(json!({"target": "size", "value": 42})));
        assert_eq!(tasks[3].results, Some(json!([1, 2])));
        assert_eq!(tasks[4].results, Some(json!("done")));
        assert!(tasks.iter().all(|t| t.task_id == "step-2" && t.name == "Check size"));
    }

    #[tokio::test]
    async fn store_failure_is_swallowed() {
        let env = TestEnv::new();
        env.store.fail_task_writes(true);
        let ins = DagInstance::new("dag-1", Trigger::Manually);
        let hooks = LifecycleHooks::new(&env.engine, &ins);

        hooks.branch_start(&CallFrame::new("s", "t")).await;
        assert!(env.store.tasks(&ins.id).is_empty());
    }
}
