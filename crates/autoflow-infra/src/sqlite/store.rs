//! SQLite document store implementation.
//!
//! Implements `Store` from `autoflow-core`. Dags and DagInstances are kept
//! as JSON documents next to a few indexed columns; an instance's ShareData
//! lives in its own column using the ShareData store encoding. Patches are
//! applied read-modify-write inside a writer transaction.

use autoflow_core::repository::store::Store;
use autoflow_types::dag::Dag;
use autoflow_types::error::RepositoryError;
use autoflow_types::ext_data::{ExtData, ExtDataField};
use autoflow_types::instance::{DagInstance, DagInstanceMode, DagInstancePatch};
use autoflow_types::share_data::ShareData;
use autoflow_types::task::{TaskInstance, TaskInstancePatch, TaskInstanceStatus, TaskTrace};
use chrono::{DateTime, Utc};
use sqlx::Row;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `Store`.
pub struct SqliteStore {
    pool: DatabasePool,
}

impl SqliteStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Private Row types for SQLite-to-domain mapping
// ---------------------------------------------------------------------------

struct InstanceRow {
    document: String,
    share_data: String,
}

impl InstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            document: row.try_get("document")?,
            share_data: row.try_get("share_data")?,
        })
    }

    fn into_instance(self) -> Result<DagInstance, RepositoryError> {
        let mut ins: DagInstance = serde_json::from_str(&self.document)
            .map_err(|e| RepositoryError::Query(format!("invalid instance document: {e}")))?;
        let doc: serde_json::Value = serde_json::from_str(&self.share_data)
            .map_err(|e| RepositoryError::Query(format!("invalid share data: {e}")))?;
        ins.share_data = ShareData::from_document(doc)
            .map_err(|e| RepositoryError::Query(format!("invalid share data: {e}")))?;
        Ok(ins)
    }
}

/// Column values written for one DagInstance.
struct InstanceColumns {
    document: String,
    share_data: String,
}

impl InstanceColumns {
    fn encode(ins: &DagInstance) -> Result<Self, RepositoryError> {
        let mut document = serde_json::to_value(ins)
            .map_err(|e| RepositoryError::Query(format!("failed to serialize instance: {e}")))?;
        // ShareData is stored in its own column.
        if let Some(obj) = document.as_object_mut() {
            obj.insert("share_data".to_string(), serde_json::Value::Null);
        }
        let share_data = ins
            .share_data
            .to_document()
            .map_err(|e| RepositoryError::Query(format!("failed to encode share data: {e}")))?;
        Ok(Self {
            document: document.to_string(),
            share_data: share_data.to_string(),
        })
    }
}

struct TaskRow {
    id: String,
    task_id: String,
    dag_ins_id: String,
    name: String,
    action_name: String,
    params: Option<String>,
    results: Option<String>,
    status: String,
    reason: String,
    traces: String,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            dag_ins_id: row.try_get("dag_ins_id")?,
            name: row.try_get("name")?,
            action_name: row.try_get("action_name")?,
            params: row.try_get("params")?,
            results: row.try_get("results")?,
            status: row.try_get("status")?,
            reason: row.try_get("reason")?,
            traces: row.try_get("traces")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_task(self) -> Result<TaskInstance, RepositoryError> {
        let status: TaskInstanceStatus = self
            .status
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;

        Ok(TaskInstance {
            id: self.id,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            task_id: self.task_id,
            dag_ins_id: self.dag_ins_id,
            name: self.name,
            action_name: self.action_name,
            params: parse_json_opt(self.params.as_deref())?,
            results: parse_json_opt(self.results.as_deref())?,
            status,
            reason: self.reason,
            traces: parse_traces(&self.traces)?,
        })
    }
}

struct ExtDataRow {
    id: String,
    dag_id: String,
    dag_ins_id: String,
    field: String,
    oss_id: String,
    oss_key: String,
    size: i64,
    removed: bool,
    created_at: String,
    updated_at: String,
}

impl ExtDataRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            dag_id: row.try_get("dag_id")?,
            dag_ins_id: row.try_get("dag_ins_id")?,
            field: row.try_get("field")?,
            oss_id: row.try_get("oss_id")?,
            oss_key: row.try_get("oss_key")?,
            size: row.try_get("size")?,
            removed: row.try_get("removed")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_ext_data(self) -> Result<ExtData, RepositoryError> {
        let field = match self.field.as_str() {
            "shareData" => ExtDataField::ShareData,
            "dump" => ExtDataField::Dump,
            other => {
                return Err(RepositoryError::Query(format!(
                    "invalid ext data field: '{other}'"
                )));
            }
        };

        Ok(ExtData {
            id: self.id,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            dag_id: self.dag_id,
            dag_ins_id: self.dag_ins_id,
            field,
            oss_id: self.oss_id,
            oss_key: self.oss_key,
            size: u64::try_from(self.size).unwrap_or_default(),
            removed: self.removed,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_json_opt(s: Option<&str>) -> Result<Option<serde_json::Value>, RepositoryError> {
    s.map(serde_json::from_str)
        .transpose()
        .map_err(|e| RepositoryError::Query(format!("invalid JSON value: {e}")))
}

fn parse_traces(s: &str) -> Result<Vec<TaskTrace>, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid task traces: {e}")))
}

fn traces_json(traces: &[TaskTrace]) -> Result<String, RepositoryError> {
    serde_json::to_string(traces)
        .map_err(|e| RepositoryError::Query(format!("failed to serialize task traces: {e}")))
}

fn to_json_opt(value: Option<&serde_json::Value>) -> Option<String> {
    value.map(|v| v.to_string())
}

fn parse_dag(definition: &str) -> Result<Dag, RepositoryError> {
    serde_json::from_str(definition)
        .map_err(|e| RepositoryError::Query(format!("invalid dag definition: {e}")))
}

fn mode_str(mode: DagInstanceMode) -> &'static str {
    match mode {
        DagInstanceMode::Schedule => "schedule",
        DagInstanceMode::Vm => "vm",
    }
}

fn rows_to_tasks(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<TaskInstance>, RepositoryError> {
    let mut tasks = Vec::with_capacity(rows.len());
    for row in rows {
        let task_row = TaskRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
        tasks.push(task_row.into_task()?);
    }
    Ok(tasks)
}

fn rows_to_instances(
    rows: &[sqlx::sqlite::SqliteRow],
) -> Result<Vec<DagInstance>, RepositoryError> {
    let mut instances = Vec::with_capacity(rows.len());
    for row in rows {
        let ins_row =
            InstanceRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
        instances.push(ins_row.into_instance()?);
    }
    Ok(instances)
}

// ---------------------------------------------------------------------------
// Store implementation
// ---------------------------------------------------------------------------

impl Store for SqliteStore {
    async fn get_dag(
        &self,
        id: &str,
        version_id: Option<&str>,
    ) -> Result<Option<Dag>, RepositoryError> {
        let row = match version_id {
            Some(version_id) => sqlx::query(
                "SELECT definition FROM dag_versions WHERE dag_id = ? AND version_id = ?",
            )
            .bind(id)
            .bind(version_id)
            .fetch_optional(&self.pool.reader)
            .await,
            None => sqlx::query("SELECT definition FROM dags WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool.reader)
                .await,
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let definition: String = row
                    .try_get("definition")
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(parse_dag(&definition)?))
            }
            None => Ok(None),
        }
    }

    async fn save_dag(&self, dag: &Dag) -> Result<(), RepositoryError> {
        let definition = serde_json::to_string(dag)
            .map_err(|e| RepositoryError::Query(format!("failed to serialize dag: {e}")))?;

        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO dags (id, name, user_id, version_id, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                   name = excluded.name,
                   user_id = excluded.user_id,
                   version_id = excluded.version_id,
                   definition = excluded.definition,
                   updated_at = excluded.updated_at"#,
        )
        .bind(&dag.id)
        .bind(&dag.name)
        .bind(&dag.user_id)
        .bind(&dag.version_id)
        .bind(&definition)
        .bind(format_datetime(&dag.created_at))
        .bind(format_datetime(&dag.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if !dag.version_id.is_empty() {
            sqlx::query(
                r#"INSERT INTO dag_versions (version_id, dag_id, definition, created_at)
                   VALUES (?, ?, ?, ?)
                   ON CONFLICT(version_id) DO UPDATE SET definition = excluded.definition"#,
            )
            .bind(&dag.version_id)
            .bind(&dag.id)
            .bind(&definition)
            .bind(format_datetime(&dag.updated_at))
            .execute(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn list_dags(&self) -> Result<Vec<Dag>, RepositoryError> {
        let rows = sqlx::query("SELECT definition FROM dags ORDER BY updated_at DESC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut dags = Vec::with_capacity(rows.len());
        for row in &rows {
            let definition: String = row
                .try_get("definition")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            dags.push(parse_dag(&definition)?);
        }
        Ok(dags)
    }

    async fn create_dag_ins(&self, ins: &DagInstance) -> Result<(), RepositoryError> {
        let columns = InstanceColumns::encode(ins)?;

        sqlx::query(
            r#"INSERT INTO dag_instances
                   (id, dag_id, status, mode, user_id, document, share_data, created_at, updated_at, ended_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                   dag_id = excluded.dag_id,
                   status = excluded.status,
                   mode = excluded.mode,
                   user_id = excluded.user_id,
                   document = excluded.document,
                   share_data = excluded.share_data,
                   updated_at = excluded.updated_at,
                   ended_at = excluded.ended_at"#,
        )
        .bind(&ins.id)
        .bind(&ins.dag_id)
        .bind(ins.status.as_str())
        .bind(mode_str(ins.mode))
        .bind(&ins.user_id)
        .bind(&columns.document)
        .bind(&columns.share_data)
        .bind(format_datetime(&ins.created_at))
        .bind(format_datetime(&ins.updated_at))
        .bind(ins.ended_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_dag_ins(&self, id: &str) -> Result<Option<DagInstance>, RepositoryError> {
        let row = sqlx::query("SELECT document, share_data FROM dag_instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let ins_row =
                    InstanceRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(ins_row.into_instance()?))
            }
            None => Ok(None),
        }
    }

    async fn list_dag_ins(
        &self,
        dag_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<DagInstance>, RepositoryError> {
        let rows = match dag_id {
            Some(dag_id) => sqlx::query(
                "SELECT document, share_data FROM dag_instances WHERE dag_id = ? ORDER BY created_at DESC LIMIT ?",
            )
            .bind(dag_id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool.reader)
            .await,
            None => sqlx::query(
                "SELECT document, share_data FROM dag_instances ORDER BY created_at DESC LIMIT ?",
            )
            .bind(i64::from(limit))
            .fetch_all(&self.pool.reader)
            .await,
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows_to_instances(&rows)
    }

    async fn patch_dag_ins(&self, patch: &DagInstancePatch) -> Result<(), RepositoryError> {
        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let row = sqlx::query("SELECT document, share_data FROM dag_instances WHERE id = ?")
            .bind(&patch.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?
            .ok_or(RepositoryError::NotFound)?;

        let mut ins = InstanceRow::from_row(&row)
            .map_err(|e| RepositoryError::Query(e.to_string()))?
            .into_instance()?;
        ins.apply_patch(patch);
        let columns = InstanceColumns::encode(&ins)?;

        sqlx::query(
            r#"UPDATE dag_instances
               SET dag_id = ?, status = ?, document = ?, share_data = ?, updated_at = ?, ended_at = ?
               WHERE id = ?"#,
        )
        .bind(&ins.dag_id)
        .bind(ins.status.as_str())
        .bind(&columns.document)
        .bind(&columns.share_data)
        .bind(format_datetime(&ins.updated_at))
        .bind(ins.ended_at.as_ref().map(format_datetime))
        .bind(&ins.id)
        .execute(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn batch_create_task_ins(&self, tasks: &[TaskInstance]) -> Result<(), RepositoryError> {
        if tasks.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        for task in tasks {
            sqlx::query(
                r#"INSERT INTO task_instances
                       (id, dag_ins_id, task_id, name, action_name, params, results, status, reason, traces, created_at, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(&task.id)
            .bind(&task.dag_ins_id)
            .bind(&task.task_id)
            .bind(&task.name)
            .bind(&task.action_name)
            .bind(to_json_opt(task.params.as_ref()))
            .bind(to_json_opt(task.results.as_ref()))
            .bind(task.status.as_str())
            .bind(&task.reason)
            .bind(traces_json(&task.traces)?)
            .bind(format_datetime(&task.created_at))
            .bind(format_datetime(&task.updated_at))
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(ref db_err) = e {
                    if db_err.message().contains("UNIQUE") {
                        return RepositoryError::Conflict(format!(
                            "task instance {} already exists",
                            task.id
                        ));
                    }
                }
                RepositoryError::Query(e.to_string())
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn patch_task_ins(&self, patch: &TaskInstancePatch) -> Result<(), RepositoryError> {
        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        // Traces are appended, so the stored list is read under the writer.
        let traces = if patch.traces.is_empty() {
            None
        } else {
            let stored: Option<String> =
                sqlx::query_scalar("SELECT traces FROM task_instances WHERE id = ?")
                    .bind(&patch.id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
            let mut traces = parse_traces(&stored.ok_or(RepositoryError::NotFound)?)?;
            traces.extend(patch.traces.iter().cloned());
            Some(traces_json(&traces)?)
        };

        let result = sqlx::query(
            r#"UPDATE task_instances
               SET status = COALESCE(?, status),
                   reason = COALESCE(?, reason),
                   results = COALESCE(?, results),
                   traces = COALESCE(?, traces),
                   updated_at = ?
               WHERE id = ?"#,
        )
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.reason.as_deref())
        .bind(to_json_opt(patch.results.as_ref()))
        .bind(traces)
        .bind(format_datetime(&Utc::now()))
        .bind(&patch.id)
        .execute(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn list_task_ins(&self, dag_ins_id: &str) -> Result<Vec<TaskInstance>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM task_instances WHERE dag_ins_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(dag_ins_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows_to_tasks(&rows)
    }

    async fn delete_task_ins_by_dag_ins_id(&self, dag_ins_id: &str) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM task_instances WHERE dag_ins_id = ?")
            .bind(dag_ins_id)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn insert_ext_data(&self, descriptors: &[ExtData]) -> Result<(), RepositoryError> {
        if descriptors.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        for ext in descriptors {
            sqlx::query(
                r#"INSERT INTO dag_instance_ext_data
                       (id, dag_id, dag_ins_id, field, oss_id, oss_key, size, removed, created_at, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(&ext.id)
            .bind(&ext.dag_id)
            .bind(&ext.dag_ins_id)
            .bind(ext.field.as_str())
            .bind(&ext.oss_id)
            .bind(&ext.oss_key)
            .bind(i64::try_from(ext.size).unwrap_or(i64::MAX))
            .bind(ext.removed)
            .bind(format_datetime(&ext.created_at))
            .bind(format_datetime(&ext.updated_at))
            .execute(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn list_ext_data(&self, dag_ins_id: &str) -> Result<Vec<ExtData>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM dag_instance_ext_data WHERE dag_ins_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(dag_ins_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let ext_row = ExtDataRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            items.push(ext_row.into_ext_data()?);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoflow_types::dag::{DagStatus, Step, Trigger};
    use autoflow_types::instance::{CommandName, DagInstanceStatus};
    use serde_json::json;
    use std::collections::HashMap;

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    fn make_dag(id: &str) -> Dag {
        let mut dag = Dag::new(
            id,
            "nightly sync",
            vec![
                Step {
                    id: "trigger".to_string(),
                    title: "Start".to_string(),
                    operator: "@trigger/manual".to_string(),
                    ..Default::default()
                },
                Step {
                    id: "step-1".to_string(),
                    title: "Copy".to_string(),
                    operator: "@internal/echo".to_string(),
                    parameters: Some(json!({"path": "{{folder}}"})),
                    ..Default::default()
                },
            ],
        );
        dag.user_id = "user-1".to_string();
        dag
    }

    fn make_instance(dag_id: &str) -> DagInstance {
        let mut ins = DagInstance::new(dag_id, Trigger::Manually);
        ins.mode = DagInstanceMode::Vm;
        ins.status = DagInstanceStatus::Scheduled;
        ins.user_id = "user-1".to_string();
        ins.share_data
            .set("counter", json!(3))
            .unwrap();
        ins
    }

    fn make_task(dag_ins_id: &str, task_id: &str) -> TaskInstance {
        TaskInstance::new(dag_ins_id, task_id, "Copy", "@internal/echo", TaskInstanceStatus::Running)
            .with_params(json!({"path": "/tmp"}))
    }

    #[tokio::test]
    async fn test_save_and_get_dag() {
        let store = SqliteStore::new(test_pool().await);
        let dag = make_dag("dag-1");
        store.save_dag(&dag).await.unwrap();

        let loaded = store.get_dag("dag-1", None).await.unwrap().unwrap();
        assert_eq!(loaded.name, "nightly sync");
        assert_eq!(loaded.steps.len(), 2);
        assert_eq!(loaded.steps[1].parameters, Some(json!({"path": "{{folder}}"})));

        assert!(store.get_dag("missing", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pinned_version_survives_update() {
        let store = SqliteStore::new(test_pool().await);
        let mut dag = make_dag("dag-1");
        dag.version_id = "v1".to_string();
        store.save_dag(&dag).await.unwrap();

        dag.version_id = "v2".to_string();
        dag.status = DagStatus::Stopped;
        dag.name = "renamed".to_string();
        store.save_dag(&dag).await.unwrap();

        let v1 = store.get_dag("dag-1", Some("v1")).await.unwrap().unwrap();
        assert_eq!(v1.name, "nightly sync");
        assert_eq!(v1.status, DagStatus::Normal);

        let latest = store.get_dag("dag-1", None).await.unwrap().unwrap();
        assert_eq!(latest.name, "renamed");
        assert_eq!(latest.version_id, "v2");

        assert!(store.get_dag("dag-1", Some("v9")).await.unwrap().is_none());
        assert_eq!(store.list_dags().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_instance_round_trip_keeps_share_data() {
        let store = SqliteStore::new(test_pool().await);
        let ins = make_instance("dag-1");
        store.create_dag_ins(&ins).await.unwrap();

        let loaded = store.get_dag_ins(&ins.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, ins.id);
        assert_eq!(loaded.status, DagInstanceStatus::Scheduled);
        assert_eq!(loaded.mode, DagInstanceMode::Vm);
        assert_eq!(loaded.user_id, "user-1");
        assert_eq!(loaded.share_data.get("__counter"), Some(json!(3)));

        // The loaded copy does not share state with the original.
        loaded.share_data.set("other", json!(1)).unwrap();
        assert!(ins.share_data.get("__other").is_none());

        let raw: (String,) = sqlx::query_as("SELECT share_data FROM dag_instances WHERE id = ?")
            .bind(&ins.id)
            .fetch_one(&store.pool.reader)
            .await
            .unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw.0).unwrap();
        assert_eq!(doc["__internal_type"], "object");
    }

    #[tokio::test]
    async fn test_patch_only_touches_present_fields() {
        let store = SqliteStore::new(test_pool().await);
        let mut ins = make_instance("dag-1");
        ins.reason = "initial".to_string();
        store.create_dag_ins(&ins).await.unwrap();

        let ext = ExtData::new("dag-1", ins.id.clone(), ExtDataField::Dump);
        let mut patch = DagInstancePatch::status(ins.id.clone(), DagInstanceStatus::Blocked);
        patch.dump = Some(String::new());
        patch.dump_ext = Some(Some(ext.clone()));
        patch.share_data = Some(HashMap::from([("__k".to_string(), json!("v"))]));
        store.patch_dag_ins(&patch).await.unwrap();

        let loaded = store.get_dag_ins(&ins.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, DagInstanceStatus::Blocked);
        assert_eq!(loaded.reason, "initial");
        assert_eq!(loaded.dump_ext, Some(ext));
        assert_eq!(loaded.share_data.get_all(), HashMap::from([("__k".to_string(), json!("v"))]));

        let mut clear = DagInstancePatch::new(ins.id.clone());
        clear.dump_ext = Some(None);
        store.patch_dag_ins(&clear).await.unwrap();
        let loaded = store.get_dag_ins(&ins.id).await.unwrap().unwrap();
        assert!(loaded.dump_ext.is_none());
        assert_eq!(loaded.status, DagInstanceStatus::Blocked);
    }

    #[tokio::test]
    async fn test_patch_command_and_status_column() {
        let store = SqliteStore::new(test_pool().await);
        let mut ins = make_instance("dag-1");
        ins.status = DagInstanceStatus::Running;
        store.create_dag_ins(&ins).await.unwrap();

        ins.cancel(vec!["t-1".to_string()]).unwrap();
        let mut patch = DagInstancePatch::new(ins.id.clone());
        patch.cmd = Some(ins.cmd.clone());
        store.patch_dag_ins(&patch).await.unwrap();

        let loaded = store.get_dag_ins(&ins.id).await.unwrap().unwrap();
        let cmd = loaded.cmd.unwrap();
        assert_eq!(cmd.name, CommandName::Cancel);
        assert_eq!(cmd.target_task_ins_ids, vec!["t-1".to_string()]);

        store
            .patch_dag_ins(&DagInstancePatch::status(ins.id.clone(), DagInstanceStatus::Failed))
            .await
            .unwrap();
        let status: (String,) = sqlx::query_as("SELECT status FROM dag_instances WHERE id = ?")
            .bind(&ins.id)
            .fetch_one(&store.pool.reader)
            .await
            .unwrap();
        assert_eq!(status.0, "failed");
    }

    #[tokio::test]
    async fn test_patch_unknown_instance_is_not_found() {
        let store = SqliteStore::new(test_pool().await);
        let err = store
            .patch_dag_ins(&DagInstancePatch::status("nope", DagInstanceStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_list_instances_filters_by_dag() {
        let store = SqliteStore::new(test_pool().await);
        for dag_id in ["dag-a", "dag-a", "dag-b"] {
            store.create_dag_ins(&make_instance(dag_id)).await.unwrap();
        }

        assert_eq!(store.list_dag_ins(Some("dag-a"), 10).await.unwrap().len(), 2);
        assert_eq!(store.list_dag_ins(Some("dag-b"), 10).await.unwrap().len(), 1);
        assert_eq!(store.list_dag_ins(None, 10).await.unwrap().len(), 3);
        assert_eq!(store.list_dag_ins(None, 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_task_lifecycle() {
        let store = SqliteStore::new(test_pool().await);
        let tasks = vec![make_task("ins-1", "step-1"), make_task("ins-1", "step-2")];
        store.batch_create_task_ins(&tasks).await.unwrap();
        store.batch_create_task_ins(&[make_task("ins-2", "step-1")]).await.unwrap();

        let mut patch = TaskInstancePatch::new(tasks[0].id.clone());
        patch.status = Some(TaskInstanceStatus::Success);
        patch.results = Some(json!({"copied": 4}));
        store.patch_task_ins(&patch).await.unwrap();

        let listed = store.list_task_ins("ins-1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].task_id, "step-1");
        assert_eq!(listed[0].status, TaskInstanceStatus::Success);
        assert_eq!(listed[0].results, Some(json!({"copied": 4})));
        assert_eq!(listed[0].params, Some(json!({"path": "/tmp"})));
        assert_eq!(listed[1].status, TaskInstanceStatus::Running);
        assert!(listed[1].results.is_none());

        assert_eq!(store.delete_task_ins_by_dag_ins_id("ins-1").await.unwrap(), 2);
        assert!(store.list_task_ins("ins-1").await.unwrap().is_empty());
        assert_eq!(store.list_task_ins("ins-2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_task_is_conflict() {
        let store = SqliteStore::new(test_pool().await);
        let task = make_task("ins-1", "step-1");
        store.batch_create_task_ins(std::slice::from_ref(&task)).await.unwrap();

        let err = store.batch_create_task_ins(&[task]).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_patch_unknown_task_is_not_found() {
        let store = SqliteStore::new(test_pool().await);
        let err = store
            .patch_task_ins(&TaskInstancePatch::failed("nope", "boom"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_patch_appends_traces() {
        let store = SqliteStore::new(test_pool().await);
        let task = make_task("ins-1", "step-1");
        store.batch_create_task_ins(std::slice::from_ref(&task)).await.unwrap();

        let first = TaskInstancePatch {
            traces: vec![TaskTrace::new("listing folder")],
            ..TaskInstancePatch::new(task.id.clone())
        };
        store.patch_task_ins(&first).await.unwrap();
        let second = TaskInstancePatch {
            traces: vec![TaskTrace::new("copied 4 files")],
            ..TaskInstancePatch::failed(task.id.clone(), "quota exceeded")
        };
        store.patch_task_ins(&second).await.unwrap();

        let listed = store.list_task_ins("ins-1").await.unwrap();
        let messages: Vec<&str> = listed[0].traces.iter().map(|t| t.message.as_str()).collect();
        assert_eq!(messages, vec!["listing folder", "copied 4 files"]);
        assert_eq!(listed[0].status, TaskInstanceStatus::Failed);
        assert_eq!(listed[0].reason, "quota exceeded");

        let orphan = TaskInstancePatch {
            traces: vec![TaskTrace::new("lost")],
            ..TaskInstancePatch::new("nope")
        };
        let err = store.patch_task_ins(&orphan).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_ext_data_insert_and_list() {
        let store = SqliteStore::new(test_pool().await);
        let mut share = ExtData::new("dag-1", "ins-1", ExtDataField::ShareData);
        share.oss_id = "local".to_string();
        share.oss_key = share.object_key("automation");
        share.size = 5_000_000;
        let dump = ExtData::new("dag-1", "ins-1", ExtDataField::Dump);

        store.insert_ext_data(&[share.clone(), dump.clone()]).await.unwrap();

        let listed = store.list_ext_data("ins-1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&share));
        assert!(listed.contains(&dump));
        assert!(store.list_ext_data("ins-2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offloaded_fields_round_trip_through_disk() {
        use crate::storage::local::LocalObjectStorage;
        use autoflow_core::engine::Engine;
        use autoflow_types::config::EngineConfig;
        use std::sync::Arc;

        let data_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(test_pool().await));
        let objects = Arc::new(LocalObjectStorage::in_data_dir(data_dir.path()));
        let config = EngineConfig {
            max_inline_size: 64,
            blob_retry_delay_ms: 0,
            ..EngineConfig::default()
        };
        let engine = Engine::builder(store.clone(), objects).config(config).build();

        let ins = make_instance("dag-1");
        store.create_dag_ins(&ins).await.unwrap();
        ins.share_data.set("report", json!("x".repeat(200))).unwrap();

        let mut patch = DagInstancePatch::status(ins.id.clone(), DagInstanceStatus::Blocked);
        patch.share_data = Some(ins.share_data.get_all());
        patch.dump = Some("short".to_string());
        engine.offloader().save_ext_data(&ins, &mut patch).await.unwrap();
        store.patch_dag_ins(&patch).await.unwrap();
        engine.background().wait_idle().await;

        let mut loaded = store.get_dag_ins(&ins.id).await.unwrap().unwrap();
        assert!(loaded.share_data.is_empty());
        assert!(loaded.dump_ext.is_none());
        let ext = loaded.share_data_ext.clone().unwrap();
        assert!(data_dir.path().join("objects").join(&ext.oss_key).exists());
        assert_eq!(store.list_ext_data(&ins.id).await.unwrap(), vec![ext]);

        engine.offloader().load_ext_data(&mut loaded).await.unwrap();
        assert_eq!(loaded.share_data.get_all(), ins.share_data.get_all());
        assert_eq!(loaded.dump, "short");
    }
}
