//! The engine: collaborators wired together, plus the run-level operations
//! (start, cancel, retry, boot).

use std::collections::HashMap;
use std::sync::Arc;

use autoflow_types::audit::AuditEntry;
use autoflow_types::config::EngineConfig;
use autoflow_types::dag::{Dag, Trigger};
use autoflow_types::error::{DagError, RepositoryError};
use autoflow_types::instance::{DagInstance, DagInstanceMode, DagInstancePatch};
use thiserror::Error;

use crate::action::ActionRegistry;
use crate::ext_data::ExtDataOffloader;
use crate::repository::object_storage::ObjectStorage;
use crate::repository::store::Store;
use crate::service::audit::{AuditSink, LogAuditSink};
use crate::service::background::BackgroundTasks;
use crate::service::callback::{CallbackSender, NoopCallbackSender};
use crate::service::lock::{InProcessLockService, LockService};
use crate::service::token::{NoTokenProvider, TokenProvider};
use crate::vm::extension::{BootError, VmExtension};
use crate::vm::{ProgramGenerator, StepProgramGenerator, Vm};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("dag not found: {0}")]
    DagNotFound(String),

    #[error("dag instance not found: {0}")]
    InstanceNotFound(String),

    #[error(transparent)]
    Dag(#[from] DagError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

pub struct Engine<S: Store> {
    store: Arc<S>,
    locks: Arc<dyn LockService>,
    objects: Arc<dyn ObjectStorage>,
    tokens: Arc<dyn TokenProvider>,
    audit: Arc<dyn AuditSink>,
    callbacks: Arc<dyn CallbackSender>,
    actions: Arc<ActionRegistry>,
    generator: Arc<dyn ProgramGenerator>,
    config: Arc<EngineConfig>,
    background: BackgroundTasks,
    offloader: ExtDataOffloader<S>,
}

impl<S: Store> Engine<S> {
    pub fn builder(store: Arc<S>, objects: Arc<dyn ObjectStorage>) -> EngineBuilder<S> {
        EngineBuilder::new(store, objects)
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn locks(&self) -> &Arc<dyn LockService> {
        &self.locks
    }

    pub fn objects(&self) -> &Arc<dyn ObjectStorage> {
        &self.objects
    }

    pub fn tokens(&self) -> &Arc<dyn TokenProvider> {
        &self.tokens
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    pub fn callbacks(&self) -> &Arc<dyn CallbackSender> {
        &self.callbacks
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    pub fn generator(&self) -> &dyn ProgramGenerator {
        self.generator.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn background(&self) -> &BackgroundTasks {
        &self.background
    }

    pub fn offloader(&self) -> &ExtDataOffloader<S> {
        &self.offloader
    }

    /// Create a run record for `dag` and submit its start audit entry.
    ///
    /// The instance is not persisted. Debug Dags and single-step debug runs
    /// are not audited.
    pub fn run_dag(
        &self,
        dag: &Dag,
        trigger: Trigger,
        vars: HashMap<String, String>,
    ) -> Result<DagInstance, DagError> {
        let ins = dag.run(trigger, vars)?;
        if !dag.is_debug && !ins.is_debug() {
            self.submit_audit(AuditEntry::start_of(dag, &ins));
        }
        Ok(ins)
    }

    pub(crate) fn submit_audit(&self, entry: AuditEntry) {
        let audit = self.audit.clone();
        self.background.spawn("audit_log", async move {
            audit.log(entry).await?;
            Ok(())
        });
    }

    /// Load the latest definition of `dag_id`, run it and persist the
    /// instance in VM mode, ready for [`Engine::boot`].
    pub async fn start_dag(
        &self,
        dag_id: &str,
        trigger: Trigger,
        vars: HashMap<String, String>,
    ) -> Result<DagInstance, EngineError> {
        let dag = self
            .store
            .get_dag(dag_id, None)
            .await?
            .ok_or_else(|| EngineError::DagNotFound(dag_id.to_string()))?;
        let mut ins = self.run_dag(&dag, trigger, vars)?;
        ins.mode = DagInstanceMode::Vm;
        self.store.create_dag_ins(&ins).await?;
        tracing::info!(dag_id, dag_ins_id = %ins.id, trigger = %trigger, "dag instance created");
        Ok(ins)
    }

    async fn load_instance(&self, id: &str) -> Result<DagInstance, EngineError> {
        self.store
            .get_dag_ins(id)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound(id.to_string()))
    }

    /// Attach a cancel command to a running instance.
    pub async fn cancel_dag_ins(
        &self,
        id: &str,
        task_ins_ids: Vec<String>,
    ) -> Result<DagInstance, EngineError> {
        let mut ins = self.load_instance(id).await?;
        ins.cancel(task_ins_ids)?;
        let patch = DagInstancePatch {
            cmd: Some(ins.cmd.clone()),
            ..DagInstancePatch::new(ins.id.clone())
        };
        self.store.patch_dag_ins(&patch).await?;
        tracing::info!(dag_ins_id = %ins.id, "cancel command attached");
        Ok(ins)
    }

    /// Attach a retry command for the given task instances.
    pub async fn retry_dag_ins(
        &self,
        id: &str,
        task_ins_ids: Vec<String>,
    ) -> Result<DagInstance, EngineError> {
        let mut ins = self.load_instance(id).await?;
        ins.retry(task_ins_ids)?;
        let patch = DagInstancePatch {
            cmd: Some(ins.cmd.clone()),
            ..DagInstancePatch::new(ins.id.clone())
        };
        self.store.patch_dag_ins(&patch).await?;
        tracing::info!(dag_ins_id = %ins.id, "retry command attached");
        Ok(ins)
    }

    /// Boot `ins` on `vm`. Returns the instance as left by the run.
    pub async fn boot<V: Vm>(
        self: &Arc<Self>,
        ins: DagInstance,
        vm: V,
    ) -> Result<DagInstance, BootError> {
        let mut ext = VmExtension::new(self.clone(), vm, ins);
        ext.boot().await?;
        Ok(ext.into_instance())
    }
}

/// Builder for [`Engine`]. Every collaborator except the store and object
/// storage has an in-process default.
pub struct EngineBuilder<S: Store> {
    store: Arc<S>,
    objects: Arc<dyn ObjectStorage>,
    locks: Arc<dyn LockService>,
    tokens: Arc<dyn TokenProvider>,
    audit: Arc<dyn AuditSink>,
    callbacks: Arc<dyn CallbackSender>,
    actions: ActionRegistry,
    generator: Arc<dyn ProgramGenerator>,
    config: EngineConfig,
    background: BackgroundTasks,
}

impl<S: Store> EngineBuilder<S> {
    pub fn new(store: Arc<S>, objects: Arc<dyn ObjectStorage>) -> Self {
        Self {
            store,
            objects,
            locks: Arc::new(InProcessLockService::new()),
            tokens: Arc::new(NoTokenProvider),
            audit: Arc::new(LogAuditSink),
            callbacks: Arc::new(NoopCallbackSender),
            actions: ActionRegistry::default(),
            generator: Arc::new(StepProgramGenerator),
            config: EngineConfig::default(),
            background: BackgroundTasks::new(),
        }
    }

    pub fn locks(mut self, locks: Arc<dyn LockService>) -> Self {
        self.locks = locks;
        self
    }

    pub fn tokens(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn callbacks(mut self, callbacks: Arc<dyn CallbackSender>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn actions(mut self, actions: ActionRegistry) -> Self {
        self.actions = actions;
        self
    }

    pub fn generator(mut self, generator: Arc<dyn ProgramGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn background(mut self, background: BackgroundTasks) -> Self {
        self.background = background;
        self
    }

    pub fn build(self) -> Engine<S> {
        let config = Arc::new(self.config);
        let offloader = ExtDataOffloader::new(
            self.store.clone(),
            self.objects.clone(),
            config.clone(),
            self.background.clone(),
        );
        Engine {
            store: self.store,
            locks: self.locks,
            objects: self.objects,
            tokens: self.tokens,
            audit: self.audit,
            callbacks: self.callbacks,
            actions: Arc::new(self.actions),
            generator: self.generator,
            config,
            background: self.background,
            offloader,
        }
    }
}
