//! In-memory collaborators and fixtures shared by the crate's tests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use autoflow_types::audit::AuditEntry;
use autoflow_types::callback::AsyncResponse;
use autoflow_types::config::EngineConfig;
use autoflow_types::dag::{Dag, Step};
use autoflow_types::error::RepositoryError;
use autoflow_types::ext_data::ExtData;
use autoflow_types::instance::{DagInstance, DagInstancePatch};
use autoflow_types::share_data::ShareData;
use autoflow_types::task::{TaskInstance, TaskInstancePatch, TaskInstanceStatus};
use futures_util::future::BoxFuture;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Notify;

use crate::action::{
    Action, ActionContext, ActionError, ActionRegistry, ActionTarget, AfterAction, BeforeAction,
    ObjectParameters, ParameterSpec,
};
use crate::engine::Engine;
use crate::repository::object_storage::{ObjectStorage, ObjectStorageError};
use crate::repository::store::Store;
use crate::service::audit::{AuditError, AuditSink};
use crate::service::callback::{CallbackError, CallbackSender};
use crate::service::lock::InProcessLockService;
use crate::service::token::{NoTokenProvider, Token, TokenError, TokenProvider};
use crate::vm::{CallFrame, Instruction, Vm, VmEntry, VmError, VmHost, VmState};

/// Operator the scripted VM treats as "suspend here".
pub const BLOCK_OPERATOR: &str = "@test/block";

pub fn test_config() -> EngineConfig {
    EngineConfig {
        storage_prefix: "test".to_string(),
        blob_retry_delay_ms: 0,
        ..EngineConfig::default()
    }
}

/// A Dag with a manual trigger followed by one step per operator. Step `n`
/// has id `step-n` and parameters `{"step": "step-n"}`.
pub fn test_dag(operators: &[&str]) -> Dag {
    let mut steps = vec![Step {
        id: "trigger".to_string(),
        title: "Start".to_string(),
        operator: "@trigger/manual".to_string(),
        ..Default::default()
    }];
    for (i, operator) in operators.iter().enumerate() {
        let id = format!("step-{}", i + 1);
        steps.push(Step {
            title: format!("Step {}", i + 1),
            operator: operator.to_string(),
            parameters: Some(json!({ "step": id })),
            id,
            ..Default::default()
        });
    }
    let mut dag = Dag::new("dag-test", "Test flow", steps);
    dag.user_id = "user-1".to_string();
    dag
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    dags: HashMap<String, Vec<Dag>>,
    instances: HashMap<String, DagInstance>,
    tasks: Vec<TaskInstance>,
    ext_data: Vec<ExtData>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    patch_calls: AtomicUsize,
    patch_budget: Mutex<Option<usize>>,
    fail_task_writes: AtomicBool,
    fail_ext_data: AtomicBool,
}

/// Copy an instance without sharing its ShareData scope.
fn detach(ins: &DagInstance) -> DagInstance {
    let mut copy = ins.clone();
    copy.share_data = ShareData::from_map(ins.share_data.get_all());
    copy
}

fn injected() -> RepositoryError {
    RepositoryError::Query("injected failure".to_string())
}

impl MemoryStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }

    pub fn tasks(&self, dag_ins_id: &str) -> Vec<TaskInstance> {
        self.lock()
            .tasks
            .iter()
            .filter(|t| t.dag_ins_id == dag_ins_id)
            .cloned()
            .collect()
    }

    pub fn instance(&self, id: &str) -> Option<DagInstance> {
        self.lock().instances.get(id).map(detach)
    }

    pub fn ext_data(&self) -> Vec<ExtData> {
        self.lock().ext_data.clone()
    }

    /// Number of `patch_dag_ins` calls so far, failed ones included.
    pub fn patch_count(&self) -> usize {
        self.patch_calls.load(Ordering::SeqCst)
    }

    /// Let `n` more instance patches succeed, then fail every one after.
    pub fn fail_instance_patches_after(&self, n: usize) {
        *self.patch_budget.lock().unwrap() = Some(n);
    }

    pub fn fail_task_writes(&self, fail: bool) {
        self.fail_task_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_ext_data_inserts(&self, fail: bool) {
        self.fail_ext_data.store(fail, Ordering::SeqCst);
    }
}

impl Store for MemoryStore {
    async fn get_dag(&self, id: &str, version_id: Option<&str>) -> Result<Option<Dag>, RepositoryError> {
        let state = self.lock();
        let Some(versions) = state.dags.get(id) else {
            return Ok(None);
        };
        Ok(match version_id {
            Some(v) => versions.iter().find(|d| d.version_id == v).cloned(),
            None => versions.last().cloned(),
        })
    }

    async fn save_dag(&self, dag: &Dag) -> Result<(), RepositoryError> {
        self.lock()
            .dags
            .entry(dag.id.clone())
            .or_default()
            .push(dag.clone());
        Ok(())
    }

    async fn list_dags(&self) -> Result<Vec<Dag>, RepositoryError> {
        Ok(self
            .lock()
            .dags
            .values()
            .filter_map(|v| v.last().cloned())
            .collect())
    }

    async fn create_dag_ins(&self, ins: &DagInstance) -> Result<(), RepositoryError> {
        self.lock().instances.insert(ins.id.clone(), detach(ins));
        Ok(())
    }

    async fn get_dag_ins(&self, id: &str) -> Result<Option<DagInstance>, RepositoryError> {
        Ok(self.instance(id))
    }

    async fn list_dag_ins(
        &self,
        dag_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<DagInstance>, RepositoryError> {
        let state = self.lock();
        let mut list: Vec<DagInstance> = state
            .instances
            .values()
            .filter(|i| dag_id.is_none_or(|d| i.dag_id == d))
            .map(detach)
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list.truncate(limit as usize);
        Ok(list)
    }

    async fn patch_dag_ins(&self, patch: &DagInstancePatch) -> Result<(), RepositoryError> {
        self.patch_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut budget = self.patch_budget.lock().unwrap();
            if let Some(left) = budget.as_mut() {
                if *left == 0 {
                    return Err(injected());
                }
                *left -= 1;
            }
        }
        let mut state = self.lock();
        let ins = state
            .instances
            .get_mut(&patch.id)
            .ok_or(RepositoryError::NotFound)?;
        ins.apply_patch(patch);
        Ok(())
    }

    async fn batch_create_task_ins(&self, tasks: &[TaskInstance]) -> Result<(), RepositoryError> {
        if self.fail_task_writes.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.lock().tasks.extend_from_slice(tasks);
        Ok(())
    }

    async fn patch_task_ins(&self, patch: &TaskInstancePatch) -> Result<(), RepositoryError> {
        let mut state = self.lock();
        let task = state
            .tasks
            .iter_mut()
            .find(|t| t.id == patch.id)
            .ok_or(RepositoryError::NotFound)?;
        task.apply_patch(patch);
        Ok(())
    }

    async fn list_task_ins(&self, dag_ins_id: &str) -> Result<Vec<TaskInstance>, RepositoryError> {
        Ok(self.tasks(dag_ins_id))
    }

    async fn delete_task_ins_by_dag_ins_id(&self, dag_ins_id: &str) -> Result<u64, RepositoryError> {
        let mut state = self.lock();
        let before = state.tasks.len();
        state.tasks.retain(|t| t.dag_ins_id != dag_ins_id);
        Ok((before - state.tasks.len()) as u64)
    }

    async fn insert_ext_data(&self, descriptors: &[ExtData]) -> Result<(), RepositoryError> {
        if self.fail_ext_data.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.lock().ext_data.extend_from_slice(descriptors);
        Ok(())
    }

    async fn list_ext_data(&self, dag_ins_id: &str) -> Result<Vec<ExtData>, RepositoryError> {
        Ok(self
            .lock()
            .ext_data
            .iter()
            .filter(|e| e.dag_ins_id == dag_ins_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Object storage
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryObjects {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    failing_uploads: AtomicUsize,
    uploads: AtomicUsize,
    downloads: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemoryObjects {
    pub fn fail_next_uploads(&self, n: usize) {
        self.failing_uploads.store(n, Ordering::SeqCst);
    }

    pub fn upload_calls(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn download_calls(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }
}

impl ObjectStorage for MemoryObjects {
    fn get_available(&self) -> BoxFuture<'_, Result<String, ObjectStorageError>> {
        Box::pin(async { Ok("oss-test".to_string()) })
    }

    fn upload<'a>(
        &'a self,
        _oss_id: &'a str,
        key: &'a str,
        data: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), ObjectStorageError>> {
        Box::pin(async move {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failing_uploads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if failing.is_ok() {
                return Err(ObjectStorageError::Io("injected failure".to_string()));
            }
            self.blobs.lock().unwrap().insert(key.to_string(), data);
            Ok(())
        })
    }

    fn download<'a>(
        &'a self,
        _oss_id: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Vec<u8>, ObjectStorageError>> {
        Box::pin(async move {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            self.blobs
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| ObjectStorageError::NotFound(key.to_string()))
        })
    }

    fn delete<'a>(
        &'a self,
        _oss_id: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<(), ObjectStorageError>> {
        Box::pin(async move {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.blobs.lock().unwrap().remove(key);
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Tokens, audit, callbacks
// ---------------------------------------------------------------------------

/// Issues `token-<user>` for every user.
#[derive(Default)]
pub struct StaticTokens;

impl TokenProvider for StaticTokens {
    fn get_user_token<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<Token, TokenError>> {
        Box::pin(async move {
            Ok(Token {
                user_id: user_id.to_string(),
                access_token: SecretString::from(format!("token-{user_id}")),
                expires_at: None,
            })
        })
    }
}

#[derive(Default)]
pub struct RecordingAudit {
    entries: Mutex<Vec<AuditEntry>>,
}

impl RecordingAudit {
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap().clone()
    }
}

impl AuditSink for RecordingAudit {
    fn log(&self, entry: AuditEntry) -> BoxFuture<'_, Result<(), AuditError>> {
        Box::pin(async move {
            self.entries.lock().unwrap().push(entry);
            Ok(())
        })
    }
}

#[derive(Default)]
pub struct RecordingCallbacks {
    sent: Mutex<Vec<(String, AsyncResponse)>>,
}

impl RecordingCallbacks {
    pub fn sent(&self) -> Vec<(String, AsyncResponse)> {
        self.sent.lock().unwrap().clone()
    }
}

impl CallbackSender for RecordingCallbacks {
    fn send<'a>(
        &'a self,
        url: &'a str,
        body: &'a AsyncResponse,
    ) -> BoxFuture<'a, Result<(), CallbackError>> {
        Box::pin(async move {
            self.sent
                .lock()
                .unwrap()
                .push((url.to_string(), body.clone()));
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Action returning its parameters, with configurable optional stages.
#[derive(Default)]
pub struct EchoAction {
    object_params: bool,
    before: Option<Result<TaskInstanceStatus, String>>,
    after: Option<TaskInstanceStatus>,
    run_error: Option<String>,
    runs: AtomicUsize,
    last_token_user: Mutex<Option<String>>,
    last_target: Mutex<Option<ActionTarget>>,
    after_params: Mutex<Option<Value>>,
}

impl EchoAction {
    pub fn with_object_parameters() -> Self {
        Self {
            object_params: true,
            ..Self::default()
        }
    }

    pub fn before_returns(mut self, status: TaskInstanceStatus) -> Self {
        self.before = Some(Ok(status));
        self
    }

    pub fn before_fails(mut self, message: &str) -> Self {
        self.before = Some(Err(message.to_string()));
        self
    }

    pub fn after_returns(mut self, status: TaskInstanceStatus) -> Self {
        self.after = Some(status);
        self
    }

    pub fn run_fails(mut self, message: &str) -> Self {
        self.run_error = Some(message.to_string());
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn last_token_user(&self) -> Option<String> {
        self.last_token_user.lock().unwrap().clone()
    }

    pub fn last_target(&self) -> Option<ActionTarget> {
        self.last_target.lock().unwrap().clone()
    }

    /// Parameters the after stage last received.
    pub fn after_params(&self) -> Option<Value> {
        self.after_params.lock().unwrap().clone()
    }
}

impl Action for EchoAction {
    fn run<'a>(
        &'a self,
        ctx: &'a ActionContext<'a>,
        params: Value,
    ) -> BoxFuture<'a, Result<Value, ActionError>> {
        Box::pin(async move {
            self.runs.fetch_add(1, Ordering::SeqCst);
            ctx.trace("run start");
            *self.last_token_user.lock().unwrap() = ctx.token().map(|t| t.user_id.clone());
            *self.last_target.lock().unwrap() = Some(ctx.target().clone());
            match &self.run_error {
                Some(message) => Err(ActionError::failed(message.clone())),
                None => Ok(params),
            }
        })
    }

    fn parameters(&self) -> Option<&dyn ParameterSpec> {
        if self.object_params {
            Some(&ObjectParameters as &dyn ParameterSpec)
        } else {
            None
        }
    }

    fn before(&self) -> Option<&dyn BeforeAction> {
        self.before.as_ref().map(|_| self as &dyn BeforeAction)
    }

    fn after(&self) -> Option<&dyn AfterAction> {
        self.after.as_ref().map(|_| self as &dyn AfterAction)
    }
}

impl BeforeAction for EchoAction {
    fn before<'a>(
        &'a self,
        _ctx: &'a ActionContext<'a>,
        _params: &'a Value,
    ) -> BoxFuture<'a, Result<TaskInstanceStatus, ActionError>> {
        Box::pin(async move {
            match &self.before {
                Some(Ok(status)) => Ok(*status),
                Some(Err(message)) => Err(ActionError::failed(message.clone())),
                None => Ok(TaskInstanceStatus::Running),
            }
        })
    }
}

impl AfterAction for EchoAction {
    fn after<'a>(
        &'a self,
        _ctx: &'a ActionContext<'a>,
        params: &'a Value,
    ) -> BoxFuture<'a, Result<TaskInstanceStatus, ActionError>> {
        Box::pin(async move {
            *self.after_params.lock().unwrap() = Some(params.clone());
            Ok(self.after.unwrap_or(TaskInstanceStatus::Running))
        })
    }
}

// ---------------------------------------------------------------------------
// VM
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct Snapshot {
    program: Vec<Instruction>,
    pc: usize,
    state: String,
    last: Value,
    #[serde(default)]
    error: Option<String>,
}

/// Minimal VM over [`crate::vm::StepProgramGenerator`] output: calls every
/// step's operator with its parameters in order and finishes with the last
/// result. [`BLOCK_OPERATOR`] suspends without a call.
pub struct ScriptedVm {
    program: Vec<Instruction>,
    pc: usize,
    state: VmState,
    last: Value,
    runs: Arc<AtomicUsize>,
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl ScriptedVm {
    pub fn new() -> Self {
        Self {
            program: Vec::new(),
            pc: 0,
            state: VmState::Init,
            last: Value::Null,
            runs: Arc::new(AtomicUsize::new(0)),
            gate: None,
        }
    }

    /// A VM that signals `entered` when a run begins and then waits for
    /// `proceed`.
    pub fn gated(entered: Arc<Notify>, proceed: Arc<Notify>) -> Self {
        Self {
            gate: Some((entered, proceed)),
            ..Self::new()
        }
    }

    pub fn runs(&self) -> Arc<AtomicUsize> {
        self.runs.clone()
    }
}

impl Vm for ScriptedVm {
    fn load(&mut self, program: Vec<Instruction>) {
        self.program = program;
        self.pc = 0;
        self.state = VmState::Init;
    }

    fn run<'a>(
        &'a mut self,
        host: &'a dyn VmHost,
        entry: VmEntry,
    ) -> impl Future<Output = ()> + Send + 'a {
        async move {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if let Some((entered, proceed)) = self.gate.clone() {
                entered.notify_one();
                proceed.notified().await;
            }

            match entry {
                VmEntry::Start => {
                    self.pc = 0;
                    self.last = Value::Null;
                }
                VmEntry::Resume(rets) => {
                    self.last = rets.into_iter().next().unwrap_or(Value::Null);
                }
                VmEntry::ResumeError(err) => {
                    self.state = VmState::Error(err.to_string());
                    return;
                }
            }

            self.state = VmState::Running;
            while let Some(ins) = self.program.get(self.pc).cloned() {
                self.pc += 1;
                if ins.0["kind"] != "step" {
                    continue;
                }
                let step = &ins.0["step"];
                let operator = step["operator"].as_str().unwrap_or_default();
                if operator == BLOCK_OPERATOR {
                    self.state = VmState::Wait;
                    return;
                }
                let frame = CallFrame::new(
                    step["id"].as_str().unwrap_or_default(),
                    step["title"].as_str().unwrap_or_default(),
                );
                let args = vec![step.get("parameters").cloned().unwrap_or(Value::Null)];
                match host.call(&frame, operator, args).await {
                    Ok(outcome) => {
                        self.last = outcome.results.into_iter().next().unwrap_or(Value::Null);
                        if outcome.wait {
                            self.state = VmState::Wait;
                            return;
                        }
                    }
                    Err(e) => {
                        self.state = VmState::Error(e.to_string());
                        return;
                    }
                }
            }
            self.state = VmState::Done(self.last.clone());
        }
    }

    fn state(&self) -> VmState {
        self.state.clone()
    }

    fn dump(&self) -> Result<String, VmError> {
        let (state, error) = match &self.state {
            VmState::Init => ("init", None),
            VmState::Running => ("running", None),
            VmState::Wait => ("wait", None),
            VmState::Done(_) => ("done", None),
            VmState::Error(e) => ("error", Some(e.clone())),
        };
        let snapshot = Snapshot {
            program: self.program.clone(),
            pc: self.pc,
            state: state.to_string(),
            last: self.last.clone(),
            error,
        };
        serde_json::to_string(&snapshot).map_err(|e| VmError::Dump(e.to_string()))
    }

    fn restore(&mut self, dump: &str) -> Result<(), VmError> {
        let snapshot: Snapshot =
            serde_json::from_str(dump).map_err(|e| VmError::Restore(e.to_string()))?;
        self.state = match snapshot.state.as_str() {
            "init" => VmState::Init,
            "running" => VmState::Running,
            "wait" => VmState::Wait,
            "done" => VmState::Done(snapshot.last.clone()),
            "error" => VmState::Error(snapshot.error.unwrap_or_default()),
            other => return Err(VmError::Restore(format!("unknown state {other}"))),
        };
        self.program = snapshot.program;
        self.pc = snapshot.pc;
        self.last = snapshot.last;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// An engine over in-memory collaborators, with handles to inspect them.
pub struct TestEnv {
    pub engine: Arc<Engine<MemoryStore>>,
    pub store: Arc<MemoryStore>,
    pub objects: Arc<MemoryObjects>,
    pub locks: Arc<InProcessLockService>,
    pub audit: Arc<RecordingAudit>,
    pub callbacks: Arc<RecordingCallbacks>,
    tokens: Arc<dyn TokenProvider>,
    registry: ActionRegistry,
    config: EngineConfig,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_actions(|_| {})
    }

    /// Environment with `@internal/echo` registered.
    pub fn echo() -> Self {
        Self::with_actions(|reg| {
            reg.register("@internal/echo", Arc::new(EchoAction::default()));
        })
    }

    pub fn with_actions(configure: impl FnOnce(&mut ActionRegistry)) -> Self {
        let mut registry = ActionRegistry::default();
        configure(&mut registry);
        let store = Arc::new(MemoryStore::default());
        let objects = Arc::new(MemoryObjects::default());
        let locks = Arc::new(InProcessLockService::new());
        let audit = Arc::new(RecordingAudit::default());
        let callbacks = Arc::new(RecordingCallbacks::default());
        let tokens: Arc<dyn TokenProvider> = Arc::new(StaticTokens);
        let config = test_config();
        let engine = Self::build(
            &store, &objects, &locks, &audit, &callbacks, &tokens, &registry, &config,
        );
        Self {
            engine,
            store,
            objects,
            locks,
            audit,
            callbacks,
            tokens,
            registry,
            config,
        }
    }

    pub fn without_tokens(mut self) -> Self {
        self.tokens = Arc::new(NoTokenProvider);
        self.rebuild()
    }

    pub fn with_max_inline_size(mut self, size: usize) -> Self {
        self.config.max_inline_size = size;
        self.rebuild()
    }

    fn rebuild(mut self) -> Self {
        self.engine = Self::build(
            &self.store,
            &self.objects,
            &self.locks,
            &self.audit,
            &self.callbacks,
            &self.tokens,
            &self.registry,
            &self.config,
        );
        self
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        store: &Arc<MemoryStore>,
        objects: &Arc<MemoryObjects>,
        locks: &Arc<InProcessLockService>,
        audit: &Arc<RecordingAudit>,
        callbacks: &Arc<RecordingCallbacks>,
        tokens: &Arc<dyn TokenProvider>,
        registry: &ActionRegistry,
        config: &EngineConfig,
    ) -> Arc<Engine<MemoryStore>> {
        Arc::new(
            Engine::builder(store.clone(), objects.clone())
                .locks(locks.clone())
                .audit(audit.clone())
                .callbacks(callbacks.clone())
                .tokens(tokens.clone())
                .actions(registry.clone())
                .config(config.clone())
                .build(),
        )
    }
}
