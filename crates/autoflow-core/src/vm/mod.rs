//! Interfaces to the instruction-executing VM and the glue that drives it.
//!
//! The interpreter itself is opaque: the engine only loads programs into a
//! [`Vm`], runs it against a [`VmHost`], and serializes/restores it between
//! runs. Continuation format and opcode semantics belong to the VM.

pub mod dispatch;
pub mod extension;
pub mod hooks;

use std::future::Future;

use autoflow_types::dag::Step;
use autoflow_types::error::PublicError;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use dispatch::{ActionDispatcher, DispatchError};
pub use extension::{BootError, VmExtension};
pub use hooks::LifecycleHooks;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("failed to compile step '{step_id}': {message}")]
    Compile { step_id: String, message: String },

    #[error("failed to serialize vm: {0}")]
    Dump(String),

    #[error("failed to restore vm: {0}")]
    Restore(String),
}

/// One compiled instruction. Opaque to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Instruction(pub Value);

/// Compiles Dag steps into VM instructions.
pub trait ProgramGenerator: Send + Sync {
    /// Compile the trigger step (`steps[0]`).
    fn trigger(&self, step: &Step) -> Result<Vec<Instruction>, VmError>;

    /// Compile any later step.
    fn step(&self, step: &Step) -> Result<Vec<Instruction>, VmError>;
}

/// Generator emitting one instruction per step that carries the step itself.
#[derive(Debug, Default)]
pub struct StepProgramGenerator;

impl StepProgramGenerator {
    fn encode(step: &Step, kind: &str) -> Result<Vec<Instruction>, VmError> {
        let body = serde_json::to_value(step).map_err(|e| VmError::Compile {
            step_id: step.id.clone(),
            message: e.to_string(),
        })?;
        Ok(vec![Instruction(serde_json::json!({ "kind": kind, "step": body }))])
    }
}

impl ProgramGenerator for StepProgramGenerator {
    fn trigger(&self, step: &Step) -> Result<Vec<Instruction>, VmError> {
        Self::encode(step, "trigger")
    }

    fn step(&self, step: &Step) -> Result<Vec<Instruction>, VmError> {
        Self::encode(step, "step")
    }
}

/// Compile a Dag's steps in order: trigger first, then the rest.
pub fn compile_steps(
    generator: &dyn ProgramGenerator,
    steps: &[Step],
) -> Result<Vec<Instruction>, VmError> {
    let Some((trigger, rest)) = steps.split_first() else {
        return Ok(Vec::new());
    };
    let mut program = generator.trigger(trigger)?;
    for step in rest {
        program.extend(generator.step(step)?);
    }
    Ok(program)
}

/// Where the VM stands after a run returns.
#[derive(Debug, Clone, PartialEq)]
pub enum VmState {
    Init,
    Running,
    /// Suspended inside an external call; resumable with its results.
    Wait,
    /// Finished with a return value.
    Done(Value),
    /// Finished with an error.
    Error(String),
}

/// How a run is entered.
#[derive(Debug, Clone, PartialEq)]
pub enum VmEntry {
    Start,
    /// Complete the pending call with these results.
    Resume(Vec<Value>),
    /// Fail the pending call.
    ResumeError(PublicError),
}

/// Label and title of the call frame issuing a call or hook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallFrame {
    pub label: String,
    pub title: String,
}

impl CallFrame {
    pub fn new(label: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            title: title.into(),
        }
    }
}

/// Result of a dispatched call as seen by the VM.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    /// Suspend after this call; results arrive later through `Resume`.
    pub wait: bool,
    pub results: Vec<Value>,
}

/// Host services the VM calls into while running.
pub trait VmHost: Send + Sync {
    fn call<'a>(
        &'a self,
        frame: &'a CallFrame,
        name: &'a str,
        args: Vec<Value>,
    ) -> BoxFuture<'a, Result<CallOutcome, DispatchError>>;

    fn before_assign<'a>(
        &'a self,
        frame: &'a CallFrame,
        target: &'a str,
        value: &'a Value,
    ) -> BoxFuture<'a, ()>;

    fn branch_skip<'a>(&'a self, frame: &'a CallFrame) -> BoxFuture<'a, ()>;

    fn branch_start<'a>(&'a self, frame: &'a CallFrame) -> BoxFuture<'a, ()>;

    fn loop_start<'a>(&'a self, frame: &'a CallFrame, value: &'a Value) -> BoxFuture<'a, ()>;

    fn before_return<'a>(&'a self, frame: &'a CallFrame, value: &'a Value) -> BoxFuture<'a, ()>;
}

/// The instruction-executing core.
pub trait Vm: Send {
    /// Replace the loaded program.
    fn load(&mut self, program: Vec<Instruction>);

    /// Execute until the VM waits, finishes or errors.
    fn run<'a>(
        &'a mut self,
        host: &'a dyn VmHost,
        entry: VmEntry,
    ) -> impl Future<Output = ()> + Send + 'a;

    fn state(&self) -> VmState;

    /// Serialize the whole VM into a continuation string.
    fn dump(&self) -> Result<String, VmError>;

    /// Rebuild the VM from a continuation string.
    fn restore(&mut self, dump: &str) -> Result<(), VmError>;
}
