//! DagInstance: one run record of a Dag and its state machine.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dag::{AppInfo, Trigger, VAR_SINGLE_DEBUG};
use crate::error::DagError;
use crate::ext_data::ExtData;
use crate::share_data::ShareData;
use crate::task::TaskInstanceStatus;

/// Prefix of the advisory lock key guarding one instance.
pub const LOCK_KEY_PREFIX: &str = "dag_instance_lock:";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DagInstanceStatus {
    #[default]
    Init,
    Scheduled,
    Running,
    Blocked,
    Failed,
    Success,
    Canceled,
}

impl DagInstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DagInstanceStatus::Init => "init",
            DagInstanceStatus::Scheduled => "scheduled",
            DagInstanceStatus::Running => "running",
            DagInstanceStatus::Blocked => "blocked",
            DagInstanceStatus::Failed => "failed",
            DagInstanceStatus::Success => "success",
            DagInstanceStatus::Canceled => "canceled",
        }
    }

    /// Whether the run has finished for good.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DagInstanceStatus::Success | DagInstanceStatus::Failed | DagInstanceStatus::Canceled
        )
    }
}

impl std::fmt::Display for DagInstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DagInstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| format!("invalid dag instance status: '{s}'"))
    }
}

/// Which driver executes the instance. Only `Vm` instances can be booted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DagInstanceMode {
    #[default]
    Schedule,
    Vm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandName {
    Cancel,
    Retry,
}

/// A pending operator command the driver consumes on its next step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub name: CommandName,
    #[serde(default)]
    pub target_task_ins_ids: Vec<String>,
}

/// Resolved run value of a Dag var.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagInstanceVar {
    pub value: String,
}

pub type LifecycleFn = Arc<dyn Fn(&DagInstance) + Send + Sync>;

/// Callbacks run before each state transition of an instance.
///
/// Injected per instance by whoever owns the run; the default set is empty.
#[derive(Clone, Default)]
pub struct InstanceLifecycle {
    pub before_run: Option<LifecycleFn>,
    pub before_success: Option<LifecycleFn>,
    pub before_fail: Option<LifecycleFn>,
    pub before_block: Option<LifecycleFn>,
    pub before_retry: Option<LifecycleFn>,
}

impl std::fmt::Debug for InstanceLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceLifecycle")
            .field("before_run", &self.before_run.is_some())
            .field("before_success", &self.before_success.is_some())
            .field("before_fail", &self.before_fail.is_some())
            .field("before_block", &self.before_block.is_some())
            .field("before_retry", &self.before_retry.is_some())
            .finish()
    }
}

/// One execution of a Dag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagInstance {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub dag_id: String,
    pub trigger: Trigger,
    #[serde(default)]
    pub worker: String,
    #[serde(default)]
    pub vars: BTreeMap<String, DagInstanceVar>,
    #[serde(default)]
    pub share_data: ShareData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_data_ext: Option<ExtData>,
    pub status: DagInstanceStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Command>,
    #[serde(default)]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dag_type: String,
    #[serde(default)]
    pub policy_type: String,
    #[serde(default)]
    pub app_info: AppInfo,
    #[serde(default)]
    pub priority: String,
    #[serde(default)]
    pub mode: DagInstanceMode,
    #[serde(default)]
    pub dump: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dump_ext: Option<ExtData>,
    #[serde(default)]
    pub success_callback: String,
    #[serde(default)]
    pub error_callback: String,
    #[serde(default)]
    pub call_chain: Vec<String>,
    #[serde(default)]
    pub resume_data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_status: Option<TaskInstanceStatus>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub version_id: String,
    #[serde(default)]
    pub biz_domain_id: String,
    #[serde(skip)]
    pub lifecycle: InstanceLifecycle,
}

impl DagInstance {
    pub fn new(dag_id: impl Into<String>, trigger: Trigger) -> Self {
        let now = Utc::now();
        Self {
            id: crate::new_id(),
            created_at: now,
            updated_at: now,
            dag_id: dag_id.into(),
            trigger,
            worker: String::new(),
            vars: BTreeMap::new(),
            share_data: ShareData::new(),
            share_data_ext: None,
            status: DagInstanceStatus::Init,
            reason: String::new(),
            cmd: None,
            user_id: String::new(),
            ended_at: None,
            dag_type: String::new(),
            policy_type: String::new(),
            app_info: AppInfo::default(),
            priority: String::new(),
            mode: DagInstanceMode::Schedule,
            dump: String::new(),
            dump_ext: None,
            success_callback: String::new(),
            error_callback: String::new(),
            call_chain: Vec::new(),
            resume_data: String::new(),
            resume_status: None,
            version: String::new(),
            version_id: String::new(),
            biz_domain_id: String::new(),
            lifecycle: InstanceLifecycle::default(),
        }
    }

    /// Key of the advisory lock guarding this instance.
    pub fn lock_key(&self) -> String {
        format!("{LOCK_KEY_PREFIX}{}", self.id)
    }

    fn fire(&self, hook: Option<&LifecycleFn>) {
        if let Some(hook) = hook {
            hook(self);
        }
    }

    pub fn run(&mut self) {
        self.fire(self.lifecycle.before_run.as_ref());
        self.status = DagInstanceStatus::Running;
        self.reason.clear();
    }

    pub fn success(&mut self) {
        self.fire(self.lifecycle.before_success.as_ref());
        self.status = DagInstanceStatus::Success;
        self.reason.clear();
        self.ended_at = Some(Utc::now());
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.fire(self.lifecycle.before_fail.as_ref());
        self.status = DagInstanceStatus::Failed;
        self.reason = reason.into();
        self.ended_at = Some(Utc::now());
    }

    pub fn block(&mut self, reason: impl Into<String>) {
        self.fire(self.lifecycle.before_block.as_ref());
        self.status = DagInstanceStatus::Blocked;
        self.reason = reason.into();
        self.ended_at = Some(Utc::now());
    }

    /// Attach a cancel command. Only a running instance with no pending
    /// command can be cancelled.
    pub fn cancel(&mut self, task_ins_ids: Vec<String>) -> Result<(), DagError> {
        if self.status != DagInstanceStatus::Running {
            return Err(DagError::NotRunning);
        }
        if self.cmd.is_some() {
            return Err(DagError::IncompleteCommand);
        }
        self.cmd = Some(Command {
            name: CommandName::Cancel,
            target_task_ins_ids: task_ins_ids,
        });
        Ok(())
    }

    /// Attach a retry command for the given task instances.
    pub fn retry(&mut self, task_ins_ids: Vec<String>) -> Result<(), DagError> {
        if self.cmd.is_some() {
            return Err(DagError::IncompleteCommand);
        }
        self.fire(self.lifecycle.before_retry.as_ref());
        self.cmd = Some(Command {
            name: CommandName::Retry,
            target_task_ins_ids: task_ins_ids,
        });
        Ok(())
    }

    pub fn can_modify_status(&self) -> bool {
        self.status != DagInstanceStatus::Failed
    }

    pub fn vars_get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(|v| v.value.as_str())
    }

    pub fn vars_iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.value.as_str()))
    }

    /// Single-step debug runs are excluded from audit logging.
    pub fn is_debug(&self) -> bool {
        self.vars_get(VAR_SINGLE_DEBUG) == Some("true")
    }

    /// Replace `{{key}}` placeholders in every string leaf with var values.
    pub fn render(&self, params: &Value) -> Value {
        match params {
            Value::String(s) => Value::String(self.render_str(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.render(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn render_str(&self, s: &str) -> String {
        if !s.contains("{{") {
            return s.to_string();
        }
        let mut out = s.to_string();
        for (key, value) in self.vars_iter() {
            out = out.replace(&format!("{{{{{key}}}}}"), value);
        }
        out
    }

    /// Apply a partial update in place. Only fields present on the patch change.
    pub fn apply_patch(&mut self, patch: &DagInstancePatch) {
        if let Some(dag_id) = &patch.dag_id {
            self.dag_id = dag_id.clone();
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(reason) = &patch.reason {
            self.reason = reason.clone();
        }
        if let Some(dump) = &patch.dump {
            self.dump = dump.clone();
        }
        if let Some(dict) = &patch.share_data {
            self.share_data = ShareData::from_map(dict.clone());
        }
        if let Some(ext) = &patch.share_data_ext {
            self.share_data_ext = ext.clone();
        }
        if let Some(ext) = &patch.dump_ext {
            self.dump_ext = ext.clone();
        }
        if let Some(ended_at) = patch.ended_at {
            self.ended_at = Some(ended_at);
        }
        if let Some(cmd) = &patch.cmd {
            self.cmd = cmd.clone();
        }
        self.updated_at = Utc::now();
    }
}

/// Field-wise partial update of a persisted DagInstance.
///
/// `None` leaves a field untouched. The doubly optional fields distinguish
/// "leave alone" from "clear".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DagInstancePatch {
    pub id: String,
    pub dag_id: Option<String>,
    pub status: Option<DagInstanceStatus>,
    pub reason: Option<String>,
    pub dump: Option<String>,
    pub share_data: Option<HashMap<String, Value>>,
    pub share_data_ext: Option<Option<ExtData>>,
    pub dump_ext: Option<Option<ExtData>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cmd: Option<Option<Command>>,
}

impl DagInstancePatch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn status(id: impl Into<String>, status: DagInstanceStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::new(id)
        }
    }
}
