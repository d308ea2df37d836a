//! Audit entries emitted when a run starts and when it ends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::{
    BIZ_DOMAIN_DEFAULT_ID, DAG_TYPE_DEFAULT, Dag, VAR_OPERATOR_ID, VAR_OPERATOR_NAME,
    VAR_OPERATOR_TYPE,
};
use crate::instance::{DagInstance, DagInstanceStatus};

pub const AUTHENTICATED_USER_TYPE: &str = "authenticated_user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Start,
    End,
}

impl AuditOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOperation::Start => "start",
            AuditOperation::End => "end",
        }
    }
}

/// Who the entry is attributed to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditUser {
    pub id: String,
    pub name: String,
    pub user_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub operation: AuditOperation,
    pub description: String,
    pub user: AuditUser,
    pub object: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

fn user_from(ins: &DagInstance) -> AuditUser {
    let id = ins
        .vars_get(VAR_OPERATOR_ID)
        .filter(|v| !v.is_empty())
        .unwrap_or(&ins.user_id)
        .to_string();
    AuditUser {
        id,
        name: ins.vars_get(VAR_OPERATOR_NAME).unwrap_or_default().to_string(),
        user_type: ins
            .vars_get(VAR_OPERATOR_TYPE)
            .filter(|v| !v.is_empty())
            .unwrap_or(AUTHENTICATED_USER_TYPE)
            .to_string(),
    }
}

fn or_default(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

impl AuditEntry {
    /// Entry recorded when `dag` produced `ins`.
    pub fn start_of(dag: &Dag, ins: &DagInstance) -> Self {
        let mut object = serde_json::Map::new();
        object.insert("type".into(), ins.trigger.as_str().into());
        object.insert("id".into(), ins.id.clone().into());
        object.insert("dagId".into(), dag.id.clone().into());
        object.insert("name".into(), dag.name.clone().into());
        object.insert("priority".into(), ins.priority.clone().into());

        Self {
            id: crate::new_id(),
            operation: AuditOperation::Start,
            description: format!("started a run of dag \"{}\"", dag.name),
            user: user_from(ins),
            object,
            created_at: Utc::now(),
        }
    }

    /// Entry recorded once `ins` reached Success or Failed.
    pub fn end_of(dag: &Dag, ins: &DagInstance) -> Self {
        let ended_at = ins.ended_at.unwrap_or_else(Utc::now);
        let duration = (ended_at - ins.created_at).num_seconds().max(0);

        let mut object = serde_json::Map::new();
        object.insert("type".into(), ins.trigger.as_str().into());
        object.insert("id".into(), ins.id.clone().into());
        object.insert("dagId".into(), dag.id.clone().into());
        object.insert("name".into(), dag.name.clone().into());
        object.insert("priority".into(), ins.priority.clone().into());
        object.insert("status".into(), ins.status.as_str().into());
        object.insert(
            "biz_domain_id".into(),
            or_default(&ins.biz_domain_id, BIZ_DOMAIN_DEFAULT_ID).into(),
        );
        object.insert(
            "dagType".into(),
            or_default(&ins.dag_type, DAG_TYPE_DEFAULT).into(),
        );
        object.insert("duration".into(), duration.into());

        let description = if ins.status == DagInstanceStatus::Success {
            format!("run of dag \"{}\" completed successfully", dag.name)
        } else {
            format!("run of dag \"{}\" failed", dag.name)
        };

        Self {
            id: crate::new_id(),
            operation: AuditOperation::End,
            description,
            user: user_from(ins),
            object,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::Trigger;
    use crate::instance::DagInstanceVar;
    use std::collections::HashMap;

    #[test]
    fn end_entry_fills_defaults_and_duration() {
        let dag = Dag::new("dag-1", "report", vec![]);
        let mut ins = dag.run(Trigger::Cron, HashMap::new()).unwrap();
        ins.created_at = Utc::now() - chrono::Duration::seconds(42);
        ins.success();

        let entry = AuditEntry::end_of(&dag, &ins);
        assert_eq!(entry.operation, AuditOperation::End);
        assert_eq!(entry.object["biz_domain_id"], "bd_public");
        assert_eq!(entry.object["dagType"], "default");
        assert_eq!(entry.object["status"], "success");
        assert_eq!(entry.object["type"], "cron");
        assert!(entry.object["duration"].as_i64().unwrap() >= 42);
        assert!(entry.description.contains("completed"));
    }

    #[test]
    fn user_info_comes_from_operator_vars() {
        let dag = Dag::new("dag-1", "report", vec![]);
        let mut ins = dag.run(Trigger::Manually, HashMap::new()).unwrap();
        ins.user_id = "owner".to_string();
        let entry = AuditEntry::start_of(&dag, &ins);
        assert_eq!(entry.user.id, "owner");
        assert_eq!(entry.user.user_type, AUTHENTICATED_USER_TYPE);

        ins.vars.insert(
            VAR_OPERATOR_ID.to_string(),
            DagInstanceVar { value: "op-7".to_string() },
        );
        ins.vars.insert(
            VAR_OPERATOR_NAME.to_string(),
            DagInstanceVar { value: "Ada".to_string() },
        );
        let entry = AuditEntry::start_of(&dag, &ins);
        assert_eq!(entry.user.id, "op-7");
        assert_eq!(entry.user.name, "Ada");
        assert_eq!(entry.object["dagId"], "dag-1");
    }
}
