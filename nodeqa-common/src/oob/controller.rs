//! Fake out-of-band controller protocol.
//!
//! The cluster manager invokes its OOB program as `<program> power-<action>
//! <node>`, reads the program's standard output and exit status, and decides
//! the caller-visible outcome. A [`Controller`] is anything that can stand in
//! for that program; a [`ControllerStub`] additionally lets the harness
//! program its state and read back how it was called.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use crate::error::{QaError, QaResult};
use crate::types::Payload;

/// What a controller returns to the cluster manager for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerOutput {
    pub stdout: String,
    pub exit_code: i32,
}

/// A program the cluster manager can use as its out-of-band controller.
#[async_trait]
pub trait Controller: Send + Sync {
    /// The `oob_program` value binding the manager to this controller.
    fn path(&self) -> &str;

    /// Handle one invocation with the manager's argument vector.
    async fn handle_invocation(&self, args: &[String]) -> QaResult<ControllerOutput>;
}

/// A controller whose state is injected by the harness between steps.
#[async_trait]
pub trait ControllerStub: Controller {
    /// Exit status returned by subsequent invocations.
    async fn set_exit_code(&self, exit_code: i32) -> QaResult<()>;

    /// Payload emitted on stdout by subsequent invocations.
    async fn set_payload(&self, payload: &Payload) -> QaResult<()>;

    /// Raw call-log content: the space-joined arguments of the last call.
    async fn recorded_call(&self) -> QaResult<String>;

    /// Files (or synthetic paths) owned by this stub.
    fn artifacts(&self) -> Vec<String>;

    /// Remove every artifact. Safe to call more than once.
    async fn teardown(&self) -> QaResult<()>;
}

/// Creates fresh controller stubs for a scenario run.
#[async_trait]
pub trait StubFactory: Send + Sync {
    /// Stub with call-log, payload and exit-code state.
    async fn create_stub(&self) -> QaResult<Arc<dyn ControllerStub>>;

    /// Stub that only records its call and exits 0 with no output.
    async fn create_log_only_stub(&self) -> QaResult<Arc<dyn ControllerStub>>;
}

#[derive(Debug, Default)]
struct InProcessState {
    exit_code: i32,
    payload: Payload,
    call_log: String,
    invocations: Vec<Vec<String>>,
    removed: bool,
}

/// Controller stub holding its state in memory.
#[derive(Debug)]
pub struct InProcessStub {
    path: String,
    log_only: bool,
    state: Mutex<InProcessState>,
}

impl InProcessStub {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            log_only: false,
            state: Mutex::new(InProcessState::default()),
        }
    }

    pub fn log_only(path: impl Into<String>) -> Self {
        Self {
            log_only: true,
            ..Self::new(path)
        }
    }

    /// Every argument vector received so far, oldest first.
    pub fn invocations(&self) -> Vec<Vec<String>> {
        self.lock().invocations.clone()
    }

    pub fn is_removed(&self) -> bool {
        self.lock().removed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InProcessState> {
        // State stays consistent even if a holder panicked mid-test.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_present(&self, state: &InProcessState) -> QaResult<()> {
        if state.removed {
            Err(QaError::Stub(format!("{} has been removed", self.path)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Controller for InProcessStub {
    fn path(&self) -> &str {
        &self.path
    }

    async fn handle_invocation(&self, args: &[String]) -> QaResult<ControllerOutput> {
        let mut state = self.lock();
        self.ensure_present(&state)?;
        state.call_log = format!("{}\n", args.join(" "));
        state.invocations.push(args.to_vec());

        if self.log_only {
            return Ok(ControllerOutput {
                stdout: String::new(),
                exit_code: 0,
            });
        }
        Ok(ControllerOutput {
            stdout: state.payload.to_contents(),
            exit_code: state.exit_code,
        })
    }
}

#[async_trait]
impl ControllerStub for InProcessStub {
    async fn set_exit_code(&self, exit_code: i32) -> QaResult<()> {
        if self.log_only {
            return Err(QaError::Stub(format!("{} has no exit-code state", self.path)));
        }
        let mut state = self.lock();
        self.ensure_present(&state)?;
        state.exit_code = exit_code;
        Ok(())
    }

    async fn set_payload(&self, payload: &Payload) -> QaResult<()> {
        if self.log_only {
            return Err(QaError::Stub(format!("{} has no payload state", self.path)));
        }
        let mut state = self.lock();
        self.ensure_present(&state)?;
        state.payload = payload.clone();
        Ok(())
    }

    async fn recorded_call(&self) -> QaResult<String> {
        let state = self.lock();
        self.ensure_present(&state)?;
        Ok(state.call_log.clone())
    }

    fn artifacts(&self) -> Vec<String> {
        vec![self.path.clone()]
    }

    async fn teardown(&self) -> QaResult<()> {
        self.lock().removed = true;
        Ok(())
    }
}
