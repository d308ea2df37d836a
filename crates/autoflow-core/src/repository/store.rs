//! Document store trait for Dags, DagInstances, TaskInstances and ExtData
//! descriptors.

use autoflow_types::dag::Dag;
use autoflow_types::error::RepositoryError;
use autoflow_types::ext_data::ExtData;
use autoflow_types::instance::{DagInstance, DagInstancePatch};
use autoflow_types::task::{TaskInstance, TaskInstancePatch};

/// Storage trait consumed by the engine.
///
/// Covers four entity families:
/// - **Dags:** versioned process definitions.
/// - **DagInstances:** run records, updated through field-wise patches.
/// - **TaskInstances:** one row per action call or hook event.
/// - **ExtData:** descriptors of offloaded instance fields.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait Store: Send + Sync + 'static {
    // -----------------------------------------------------------------------
    // Dags
    // -----------------------------------------------------------------------

    /// Get a Dag by ID. With `version_id`, the pinned version is returned
    /// instead of the latest definition.
    fn get_dag(
        &self,
        id: &str,
        version_id: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Option<Dag>, RepositoryError>> + Send;

    /// Upsert a Dag and record it as a version.
    fn save_dag(
        &self,
        dag: &Dag,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List the latest definition of every Dag, newest first.
    fn list_dags(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Dag>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // DagInstances
    // -----------------------------------------------------------------------

    fn create_dag_ins(
        &self,
        ins: &DagInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_dag_ins(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<DagInstance>, RepositoryError>> + Send;

    /// List instances, optionally for one Dag, newest first.
    fn list_dag_ins(
        &self,
        dag_id: Option<&str>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<DagInstance>, RepositoryError>> + Send;

    /// Apply a partial update. Returns `NotFound` for an unknown ID.
    fn patch_dag_ins(
        &self,
        patch: &DagInstancePatch,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // TaskInstances
    // -----------------------------------------------------------------------

    fn batch_create_task_ins(
        &self,
        tasks: &[TaskInstance],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn patch_task_ins(
        &self,
        patch: &TaskInstancePatch,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All task records of an instance, oldest first.
    fn list_task_ins(
        &self,
        dag_ins_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<TaskInstance>, RepositoryError>> + Send;

    /// Purge the task records of an instance. Returns the number removed.
    fn delete_task_ins_by_dag_ins_id(
        &self,
        dag_ins_id: &str,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // ExtData
    // -----------------------------------------------------------------------

    fn insert_ext_data(
        &self,
        descriptors: &[ExtData],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn list_ext_data(
        &self,
        dag_ins_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<ExtData>, RepositoryError>> + Send;
}
