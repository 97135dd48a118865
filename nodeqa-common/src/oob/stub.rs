//! File-backed controller stubs living on the target host.
//!
//! A stub is a small shell script plus three state files, all uploaded
//! through a [`CommandExecutor`]:
//!
//! ```text
//! #!/bin/bash
//! echo "$@" > <call-log>
//! cat <payload>
//! exit $(< <exit-code>)
//! ```
//!
//! The cluster manager runs the script as its OOB program; the harness
//! rewrites the payload and exit-code files between steps and reads the
//! call-log back to verify the invocation.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::controller::{Controller, ControllerOutput, ControllerStub, StubFactory};
use crate::error::{QaError, QaResult};
use crate::exec::{CommandExecutor, DEFAULT_UPLOAD_MODE, EXECUTABLE_UPLOAD_MODE, shell_quote};
use crate::types::Payload;

const FULL_SHEBANG: &str = "#!/bin/bash";
const LOG_ONLY_SHEBANG: &str = "#!/bin/sh";
const LOG_PREFIX: &str = "echo \"$@\" > ";
const PAYLOAD_PREFIX: &str = "cat ";
const EXIT_PREFIX: &str = "exit $(< ";

/// The script body of a controller stub and the state files it references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubScript {
    pub call_log: String,
    pub payload: Option<String>,
    pub exit_code: Option<String>,
}

impl StubScript {
    /// Stub recording calls, serving a payload and exiting with a stored code.
    pub fn full(
        call_log: impl Into<String>,
        payload: impl Into<String>,
        exit_code: impl Into<String>,
    ) -> Self {
        Self {
            call_log: call_log.into(),
            payload: Some(payload.into()),
            exit_code: Some(exit_code.into()),
        }
    }

    /// Stub that only records its call.
    pub fn log_only(call_log: impl Into<String>) -> Self {
        Self {
            call_log: call_log.into(),
            payload: None,
            exit_code: None,
        }
    }

    pub fn is_log_only(&self) -> bool {
        self.payload.is_none() && self.exit_code.is_none()
    }

    /// Render the script text.
    pub fn render(&self) -> String {
        let shebang = if self.is_log_only() {
            LOG_ONLY_SHEBANG
        } else {
            FULL_SHEBANG
        };
        let mut script = format!("{shebang}\n{LOG_PREFIX}{}\n", shell_quote(&self.call_log));
        if let Some(payload) = &self.payload {
            script.push_str(&format!("{PAYLOAD_PREFIX}{}\n", shell_quote(payload)));
        }
        if let Some(exit_code) = &self.exit_code {
            script.push_str(&format!("{EXIT_PREFIX}{})\n", shell_quote(exit_code)));
        }
        script
    }

    /// Recognize a script produced by [`render`](Self::render).
    pub fn parse(text: &str) -> Option<Self> {
        let mut lines = text.lines();
        let shebang = lines.next()?;
        if shebang != FULL_SHEBANG && shebang != LOG_ONLY_SHEBANG {
            return None;
        }

        let mut call_log = None;
        let mut payload = None;
        let mut exit_code = None;
        for line in lines.map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(rest) = line.strip_prefix(LOG_PREFIX) {
                call_log = Some(shell_unquote(rest)?);
            } else if let Some(rest) = line.strip_prefix(EXIT_PREFIX) {
                exit_code = Some(shell_unquote(rest.strip_suffix(')')?)?);
            } else if let Some(rest) = line.strip_prefix(PAYLOAD_PREFIX) {
                payload = Some(shell_unquote(rest)?);
            } else {
                return None;
            }
        }

        Some(Self {
            call_log: call_log?,
            payload,
            exit_code,
        })
    }

    /// Every path the script references.
    pub fn state_files(&self) -> Vec<String> {
        let mut files = vec![self.call_log.clone()];
        files.extend(self.payload.iter().cloned());
        files.extend(self.exit_code.iter().cloned());
        files
    }
}

/// Undo POSIX shell quoting of a single word.
fn shell_unquote(word: &str) -> Option<String> {
    let mut out = String::with_capacity(word.len());
    let mut chars = word.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\'' => loop {
                match chars.next()? {
                    '\'' => break,
                    c => out.push(c),
                }
            },
            '\\' => out.push(chars.next()?),
            c if c.is_whitespace() => return None,
            c => out.push(c),
        }
    }
    Some(out)
}

/// Controller stub backed by files on a host reachable through an executor.
pub struct RemoteStub {
    exec: Arc<dyn CommandExecutor>,
    path: String,
    script: StubScript,
}

impl RemoteStub {
    /// Upload the three state files and the script.
    ///
    /// Files uploaded before a failure are removed again before the error
    /// is returned.
    pub async fn create(exec: Arc<dyn CommandExecutor>) -> QaResult<Self> {
        let mut created = Vec::new();
        match Self::create_full(exec.as_ref(), &mut created).await {
            Ok((path, script)) => {
                info!(host = exec.host(), stub = %path, "created controller stub");
                Ok(Self { exec, path, script })
            }
            Err(e) => {
                cleanup_partial(exec.as_ref(), &created).await;
                Err(e)
            }
        }
    }

    /// Upload a call-log file and a script that only records its call.
    pub async fn create_log_only(exec: Arc<dyn CommandExecutor>) -> QaResult<Self> {
        let mut created = Vec::new();
        let result = async {
            let call_log = exec.upload("", DEFAULT_UPLOAD_MODE).await?;
            created.push(call_log.clone());
            let script = StubScript::log_only(call_log);
            let path = exec
                .upload(&script.render(), EXECUTABLE_UPLOAD_MODE)
                .await?;
            Ok::<_, QaError>((path, script))
        }
        .await;

        match result {
            Ok((path, script)) => {
                info!(host = exec.host(), stub = %path, "created log-only controller stub");
                Ok(Self { exec, path, script })
            }
            Err(e) => {
                cleanup_partial(exec.as_ref(), &created).await;
                Err(e)
            }
        }
    }

    async fn create_full(
        exec: &dyn CommandExecutor,
        created: &mut Vec<String>,
    ) -> QaResult<(String, StubScript)> {
        let call_log = exec.upload("", DEFAULT_UPLOAD_MODE).await?;
        created.push(call_log.clone());
        let payload = exec.upload("", DEFAULT_UPLOAD_MODE).await?;
        created.push(payload.clone());
        let exit_code = exec.upload("", DEFAULT_UPLOAD_MODE).await?;
        created.push(exit_code.clone());

        let script = StubScript::full(call_log, payload, exit_code);
        let path = exec
            .upload(&script.render(), EXECUTABLE_UPLOAD_MODE)
            .await?;
        Ok((path, script))
    }

    pub fn script(&self) -> &StubScript {
        &self.script
    }

    fn state_file(&self, file: &Option<String>, what: &str) -> QaResult<String> {
        file.clone()
            .ok_or_else(|| QaError::Stub(format!("{} has no {what} file", self.path)))
    }
}

async fn cleanup_partial(exec: &dyn CommandExecutor, created: &[String]) {
    if let Err(e) = exec.remove_files(created).await {
        warn!(host = exec.host(), "failed to remove partial stub files: {}", e);
    }
}

#[async_trait]
impl Controller for RemoteStub {
    fn path(&self) -> &str {
        &self.path
    }

    async fn handle_invocation(&self, args: &[String]) -> QaResult<ControllerOutput> {
        let mut command = Vec::with_capacity(args.len() + 1);
        command.push(self.path.clone());
        command.extend(args.iter().cloned());
        let result = self.exec.run(&command).await?;
        Ok(ControllerOutput {
            stdout: result.stdout,
            exit_code: result.exit_code,
        })
    }
}

#[async_trait]
impl ControllerStub for RemoteStub {
    async fn set_exit_code(&self, exit_code: i32) -> QaResult<()> {
        let file = self.state_file(&self.script.exit_code, "exit-code")?;
        debug!(stub = %self.path, exit_code, "injecting exit code");
        self.exec
            .upload_to(&file, &exit_code.to_string(), DEFAULT_UPLOAD_MODE)
            .await
    }

    async fn set_payload(&self, payload: &Payload) -> QaResult<()> {
        let file = self.state_file(&self.script.payload, "payload")?;
        debug!(stub = %self.path, %payload, "injecting payload");
        self.exec
            .upload_to(&file, &payload.to_contents(), DEFAULT_UPLOAD_MODE)
            .await
    }

    async fn recorded_call(&self) -> QaResult<String> {
        self.exec.read_file(&self.script.call_log).await
    }

    fn artifacts(&self) -> Vec<String> {
        let mut files = vec![self.path.clone()];
        files.extend(self.script.state_files());
        files
    }

    async fn teardown(&self) -> QaResult<()> {
        debug!(stub = %self.path, "removing controller stub");
        self.exec.remove_files(&self.artifacts()).await
    }
}

/// Creates [`RemoteStub`]s through one executor.
pub struct RemoteStubFactory {
    exec: Arc<dyn CommandExecutor>,
}

impl RemoteStubFactory {
    pub fn new(exec: Arc<dyn CommandExecutor>) -> Self {
        Self { exec }
    }
}

#[async_trait]
impl StubFactory for RemoteStubFactory {
    async fn create_stub(&self) -> QaResult<Arc<dyn ControllerStub>> {
        Ok(Arc::new(RemoteStub::create(self.exec.clone()).await?))
    }

    async fn create_log_only_stub(&self) -> QaResult<Arc<dyn ControllerStub>> {
        Ok(Arc::new(RemoteStub::create_log_only(self.exec.clone()).await?))
    }
}
