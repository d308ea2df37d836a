//! Dag definitions: the authored business process a DagInstance runs.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DagError;
use crate::instance::{DagInstance, DagInstanceVar};
use crate::share_data::ShareData;

pub const PRIORITY_LOWEST: &str = "lowest";
pub const DAG_TYPE_DEFAULT: &str = "default";
pub const DAG_TYPE_COMBO_OPERATOR: &str = "combo-operator";
pub const BIZ_DOMAIN_DEFAULT_ID: &str = "bd_public";
pub const DEFAULT_DAG_VERSION: &str = "v0.0.0";

/// Var that overrides the acting user of a combo-operator Dag.
pub const VAR_OPERATOR_ID: &str = "operator_id";
pub const VAR_OPERATOR_NAME: &str = "operator_name";
pub const VAR_OPERATOR_TYPE: &str = "operator_type";
/// Var marking a single-step debug run.
pub const VAR_SINGLE_DEBUG: &str = "single_debug";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DagStatus {
    #[default]
    Normal,
    Stopped,
}

/// How a run of the Dag was started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Trigger {
    #[default]
    Manually,
    Cron,
    Event,
    Webhook,
    Form,
    Document,
    SecurityPolicy,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Manually => "manually",
            Trigger::Cron => "cron",
            Trigger::Event => "event",
            Trigger::Webhook => "webhook",
            Trigger::Form => "form",
            Trigger::Document => "document",
            Trigger::SecurityPolicy => "security-policy",
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("invalid trigger: '{s}'"))
    }
}

/// Declared variable of a Dag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DagVar {
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub default_value: String,
}

/// Service-account binding for runs that act on behalf of an app.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppInfo {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub app_id: String,
}

/// One authored step. Only the fields the engine reads are typed; the rest
/// travels opaquely to the instruction generator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub operator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A business-process definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dag {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub status: DagStatus,
    #[serde(default)]
    pub trigger: Trigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default)]
    pub vars: BTreeMap<String, DagVar>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, rename = "type")]
    pub dag_type: String,
    #[serde(default)]
    pub policy_type: String,
    #[serde(default)]
    pub app_info: AppInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub version_id: String,
    #[serde(default)]
    pub exec_mode: String,
    #[serde(default)]
    pub operator_id: String,
    #[serde(default)]
    pub is_debug: bool,
    #[serde(default)]
    pub biz_domain_id: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Dag {
    /// Create a new, runnable Dag with the given steps.
    pub fn new(id: impl Into<String>, name: impl Into<String>, steps: Vec<Step>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            user_id: String::new(),
            desc: String::new(),
            status: DagStatus::Normal,
            trigger: Trigger::Manually,
            cron: None,
            vars: BTreeMap::new(),
            steps,
            dag_type: String::new(),
            policy_type: String::new(),
            app_info: AppInfo::default(),
            priority: None,
            version: DEFAULT_DAG_VERSION.to_string(),
            version_id: String::new(),
            exec_mode: String::new(),
            operator_id: String::new(),
            is_debug: false,
            biz_domain_id: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Produce a fresh, unpersisted run record in `Init` status.
    ///
    /// The acting user is the Dag owner, except for combo-operator Dags
    /// which act as the `operator_id` var (empty when it is not set).
    pub fn run(
        &self,
        trigger: Trigger,
        vars: HashMap<String, String>,
    ) -> Result<DagInstance, DagError> {
        if self.status != DagStatus::Normal {
            return Err(DagError::Stopped);
        }

        let priority = self
            .priority
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| PRIORITY_LOWEST.to_string());

        let user_id = if self.dag_type == DAG_TYPE_COMBO_OPERATOR {
            vars.get(VAR_OPERATOR_ID).cloned().unwrap_or_default()
        } else {
            self.user_id.clone()
        };

        let vars: BTreeMap<String, DagInstanceVar> = vars
            .into_iter()
            .map(|(k, v)| (k, DagInstanceVar { value: v }))
            .collect();

        let mut ins = DagInstance::new(self.id.clone(), trigger);
        ins.vars = vars;
        ins.share_data = ShareData::new();
        ins.user_id = user_id;
        ins.dag_type = self.dag_type.clone();
        ins.policy_type = self.policy_type.clone();
        ins.app_info = self.app_info.clone();
        ins.priority = priority;
        ins.version = self.version.clone();
        ins.version_id = self.version_id.clone();
        ins.biz_domain_id = self.biz_domain_id.clone();
        Ok(ins)
    }
}
