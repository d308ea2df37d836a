//! Boot and stop handling of one VM-mode DagInstance.
//!
//! A [`VmExtension`] binds a VM to the instance it executes. `boot` guards
//! the run with the instance's advisory lock, decides whether to start or
//! resume, and drives the VM; every time the VM stops, the continuation and
//! ShareData are persisted (offloading oversized values) and the webhooks,
//! audit entry and task purge fire in the background.

use std::sync::Arc;
use std::time::Duration;

use autoflow_types::audit::AuditEntry;
use autoflow_types::error::{PublicError, RepositoryError};
use autoflow_types::instance::{DagInstance, DagInstanceMode, DagInstancePatch, DagInstanceStatus};
use autoflow_types::task::TaskInstanceStatus;
use chrono::Utc;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use thiserror::Error;

use super::dispatch::{ActionDispatcher, DispatchError};
use super::hooks::LifecycleHooks;
use super::{CallFrame, CallOutcome, Vm, VmEntry, VmError, VmHost, VmState, compile_steps};
use crate::engine::Engine;
use crate::ext_data::ExtDataError;
use crate::repository::store::Store;
use crate::service::callback::{notify_error, notify_success};
use crate::service::lock::LockGuard;

#[derive(Debug, Error)]
pub enum BootError {
    #[error("invalid dagIns: id {id}, mode {mode:?}")]
    InvalidMode { id: String, mode: DagInstanceMode },

    #[error("invalid dagIns: id {id}, status {status}")]
    InvalidStatus { id: String, status: DagInstanceStatus },

    #[error(transparent)]
    Public(#[from] PublicError),

    #[error("invalid dagIns dump: id {0}")]
    InvalidDump(String),

    #[error("invalid resume data: {0}")]
    InvalidResumeData(#[source] serde_json::Error),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Vm(#[from] VmError),

    #[error(transparent)]
    ExtData(#[from] ExtDataError),
}

impl BootError {
    /// The error as reported through the error webhook.
    pub fn to_public(&self) -> PublicError {
        match self {
            BootError::Public(e) => e.clone(),
            _ => PublicError::internal(None),
        }
    }
}

/// Host side of the VM: calls go to the dispatcher, events to the hooks.
struct ExtensionHost<'a, S: Store> {
    dispatcher: ActionDispatcher<'a, S>,
    hooks: LifecycleHooks<'a, S>,
}

impl<S: Store> VmHost for ExtensionHost<'_, S> {
    fn call<'a>(
        &'a self,
        frame: &'a CallFrame,
        name: &'a str,
        args: Vec<Value>,
    ) -> BoxFuture<'a, Result<CallOutcome, DispatchError>> {
        Box::pin(self.dispatcher.call(frame, name, args))
    }

    fn before_assign<'a>(
        &'a self,
        frame: &'a CallFrame,
        target: &'a str,
        value: &'a Value,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.hooks.before_assign(frame, target, value))
    }

    fn branch_skip<'a>(&'a self, frame: &'a CallFrame) -> BoxFuture<'a, ()> {
        Box::pin(self.hooks.branch_skip(frame))
    }

    fn branch_start<'a>(&'a self, frame: &'a CallFrame) -> BoxFuture<'a, ()> {
        Box::pin(self.hooks.branch_start(frame))
    }

    fn loop_start<'a>(&'a self, frame: &'a CallFrame, value: &'a Value) -> BoxFuture<'a, ()> {
        Box::pin(self.hooks.loop_start(frame, value))
    }

    fn before_return<'a>(&'a self, frame: &'a CallFrame, value: &'a Value) -> BoxFuture<'a, ()> {
        Box::pin(self.hooks.before_return(frame, value))
    }
}

pub struct VmExtension<S: Store, V: Vm> {
    engine: Arc<Engine<S>>,
    vm: V,
    dag_ins: DagInstance,
}

impl<S: Store, V: Vm> VmExtension<S, V> {
    pub fn new(engine: Arc<Engine<S>>, vm: V, dag_ins: DagInstance) -> Self {
        // Persistence happens on VM stop, not on every ShareData write.
        dag_ins.share_data.set_save(None);
        Self {
            engine,
            vm,
            dag_ins,
        }
    }

    pub fn instance(&self) -> &DagInstance {
        &self.dag_ins
    }

    pub fn into_instance(self) -> DagInstance {
        self.dag_ins
    }

    pub fn vm(&self) -> &V {
        &self.vm
    }

    /// Start or resume the instance.
    ///
    /// Returns `Ok` without running anything when another worker owns the
    /// instance lock.
    pub async fn boot(&mut self) -> Result<(), BootError> {
        let id = self.dag_ins.id.clone();

        if self.dag_ins.mode != DagInstanceMode::Vm {
            let err = BootError::InvalidMode {
                id,
                mode: self.dag_ins.mode,
            };
            tracing::warn!(error = %err, "boot rejected");
            return Err(err);
        }
        if !matches!(
            self.dag_ins.status,
            DagInstanceStatus::Scheduled | DagInstanceStatus::Running
        ) {
            let err = BootError::InvalidStatus {
                id,
                status: self.dag_ins.status,
            };
            tracing::warn!(error = %err, "boot rejected");
            return Err(err);
        }

        let ttl = Duration::from_secs(self.engine.config().lock_ttl_secs);
        let guard = match LockGuard::acquire(
            self.engine.locks().clone(),
            self.dag_ins.lock_key(),
            ttl,
        )
        .await
        {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!(dag_ins_id = %id, error = %e, "lock service unavailable");
                None
            }
        };

        let Some(guard) = guard else {
            tracing::debug!(dag_ins_id = %id, "instance owned elsewhere");
            if self.dag_ins.status == DagInstanceStatus::Running {
                self.set_status(DagInstanceStatus::Scheduled).await?;
            }
            return Ok(());
        };

        let result = self.boot_locked().await;
        guard.release().await;
        result
    }

    async fn boot_locked(&mut self) -> Result<(), BootError> {
        if self.dag_ins.status == DagInstanceStatus::Scheduled {
            self.set_status(DagInstanceStatus::Running).await?;
        }
        match self.drive().await {
            Ok(()) => Ok(()),
            Err(BootError::InvalidResumeData(e)) => Err(BootError::InvalidResumeData(e)),
            Err(e) => {
                self.handle_dag_ins_error(&e).await;
                Err(e)
            }
        }
    }

    async fn set_status(&mut self, status: DagInstanceStatus) -> Result<(), BootError> {
        let patch = DagInstancePatch::status(self.dag_ins.id.clone(), status);
        if let Err(e) = self.engine.store().patch_dag_ins(&patch).await {
            let err = BootError::Repository(e);
            self.handle_dag_ins_error(&err).await;
            return Err(err);
        }
        self.dag_ins.status = status;
        Ok(())
    }

    async fn drive(&mut self) -> Result<(), BootError> {
        let dag = match self
            .engine
            .store()
            .get_dag(&self.dag_ins.dag_id, non_empty(&self.dag_ins.version_id))
            .await
        {
            Ok(Some(dag)) => dag,
            Ok(None) => {
                tracing::warn!(dag_id = %self.dag_ins.dag_id, "dag not found");
                return Err(PublicError::not_found(json!({ "dagId": self.dag_ins.dag_id })).into());
            }
            Err(e) => {
                tracing::warn!(dag_id = %self.dag_ins.dag_id, error = %e, "failed to load dag");
                return Err(PublicError::internal(None).into());
            }
        };

        self.engine.offloader().load_ext_data(&mut self.dag_ins).await?;

        if self.dag_ins.dump.is_empty() {
            let program = compile_steps(self.engine.generator(), &dag.steps)?;
            self.vm.load(program);
            self.run(VmEntry::Start).await;
            return Ok(());
        }

        if let Err(e) = self.vm.restore(&self.dag_ins.dump) {
            tracing::warn!(dag_ins_id = %self.dag_ins.id, error = %e, "failed to restore vm");
            return Err(BootError::InvalidDump(self.dag_ins.id.clone()));
        }

        let entry = match self.vm.state() {
            VmState::Wait => match serde_json::from_str::<Vec<Value>>(&self.dag_ins.resume_data) {
                Ok(rets) if self.dag_ins.resume_status == Some(TaskInstanceStatus::Success) => {
                    VmEntry::Resume(rets)
                }
                Ok(rets) => {
                    let detail = rets.into_iter().next();
                    VmEntry::ResumeError(PublicError::internal(detail))
                }
                Err(e) => {
                    self.run(VmEntry::ResumeError(PublicError::internal(Some(json!(
                        "invalid return values"
                    )))))
                    .await;
                    return Err(BootError::InvalidResumeData(e));
                }
            },
            _ => VmEntry::Start,
        };
        self.run(entry).await;
        Ok(())
    }

    /// Run the VM until it stops, then persist the outcome.
    async fn run(&mut self, entry: VmEntry) {
        {
            let host = ExtensionHost {
                dispatcher: ActionDispatcher::new(&self.engine, &self.dag_ins),
                hooks: LifecycleHooks::new(&self.engine, &self.dag_ins),
            };
            self.vm.run(&host, entry).await;
        }
        self.handle_vm_stop().await;
    }

    async fn handle_vm_stop(&mut self) {
        let id = self.dag_ins.id.clone();
        let dump = match self.vm.dump() {
            Ok(dump) => dump,
            Err(e) => {
                tracing::warn!(dag_ins_id = %id, error = %e, "failed to dump vm");
                return;
            }
        };

        let mut patch = DagInstancePatch {
            dag_id: Some(self.dag_ins.dag_id.clone()),
            dump: Some(dump.clone()),
            share_data: Some(self.dag_ins.share_data.get_all()),
            ended_at: Some(Utc::now()),
            ..DagInstancePatch::new(id.clone())
        };

        let engine = &self.engine;
        match self.vm.state() {
            VmState::Done(value) => {
                tracing::info!(dag_ins_id = %id, "run completed");
                patch.status = Some(DagInstanceStatus::Success);
                notify_success(
                    engine.background(),
                    engine.callbacks().clone(),
                    &self.dag_ins,
                    value,
                );
            }
            VmState::Error(message) => {
                tracing::info!(dag_ins_id = %id, error = %message, "run failed");
                patch.status = Some(DagInstanceStatus::Failed);
                patch.reason = Some(message.clone());
                notify_error(
                    engine.background(),
                    engine.callbacks().clone(),
                    &self.dag_ins,
                    &PublicError::internal(Some(Value::String(message))),
                );
            }
            VmState::Wait => {
                tracing::info!(dag_ins_id = %id, "run suspended");
                patch.status = Some(DagInstanceStatus::Blocked);
            }
            VmState::Init | VmState::Running => {}
        }

        if let Err(e) = engine.offloader().save_ext_data(&self.dag_ins, &mut patch).await {
            tracing::warn!(dag_ins_id = %id, error = %e, "failed to offload instance data");
            return;
        }

        if let Err(e) = engine.store().patch_dag_ins(&patch).await {
            tracing::warn!(dag_ins_id = %id, error = %e, "failed to persist vm stop");
            return;
        }

        if let Some(status) = patch.status {
            self.dag_ins.status = status;
        }
        if let Some(reason) = patch.reason.take() {
            self.dag_ins.reason = reason;
        }
        if let Some(ext) = patch.share_data_ext.take() {
            self.dag_ins.share_data_ext = ext;
        }
        if let Some(ext) = patch.dump_ext.take() {
            self.dag_ins.dump_ext = ext;
        }
        self.dag_ins.dump = dump;
        self.dag_ins.ended_at = patch.ended_at;
        self.dag_ins.updated_at = Utc::now();

        match self.dag_ins.status {
            DagInstanceStatus::Success => {
                self.submit_end_audit();
                self.submit_purge();
            }
            DagInstanceStatus::Failed => self.submit_end_audit(),
            _ => {}
        }
    }

    fn submit_end_audit(&self) {
        let store = self.engine.store().clone();
        let audit = self.engine.audit().clone();
        let ins = self.dag_ins.clone();
        self.engine.background().spawn("end_audit", async move {
            let version_id = non_empty(&ins.version_id);
            let Some(dag) = store.get_dag(&ins.dag_id, version_id).await? else {
                anyhow::bail!("dag {} not found", ins.dag_id);
            };
            if dag.is_debug || ins.is_debug() {
                return Ok(());
            }
            audit.log(AuditEntry::end_of(&dag, &ins)).await?;
            Ok(())
        });
    }

    fn submit_purge(&self) {
        let store = self.engine.store().clone();
        let id = self.dag_ins.id.clone();
        self.engine.background().spawn("purge_task_ins", async move {
            let removed = store.delete_task_ins_by_dag_ins_id(&id).await?;
            tracing::debug!(dag_ins_id = %id, removed, "task instances purged");
            Ok(())
        });
    }

    /// Mark the instance Failed and fire the error webhook.
    async fn handle_dag_ins_error(&mut self, err: &BootError) {
        let ended_at = Utc::now();
        let patch = DagInstancePatch {
            status: Some(DagInstanceStatus::Failed),
            reason: Some(err.to_string()),
            ended_at: Some(ended_at),
            ..DagInstancePatch::new(self.dag_ins.id.clone())
        };
        if let Err(e) = self.engine.store().patch_dag_ins(&patch).await {
            tracing::warn!(dag_ins_id = %self.dag_ins.id, error = %e, "failed to mark instance failed");
        }
        self.dag_ins.status = DagInstanceStatus::Failed;
        self.dag_ins.reason = err.to_string();
        self.dag_ins.ended_at = Some(ended_at);

        notify_error(
            self.engine.background(),
            self.engine.callbacks().clone(),
            &self.dag_ins,
            &err.to_public(),
        );
    }
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() { None } else { Some(s) }
}
