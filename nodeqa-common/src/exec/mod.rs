//! Command execution and file staging channels.
//!
//! Every scenario talks to the cluster through a [`CommandExecutor`]: the
//! real run uses [`SshExecutor`] against the master node, local runs and
//! file-backed stub tests use [`LocalExecutor`], and in-process tests use
//! [`SimulatedCluster`](crate::simulated::SimulatedCluster).

mod local;
mod ssh;

pub use local::LocalExecutor;
pub use ssh::{KnownHostsPolicy, SshExecutor, SshOptions};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shell_escape::escape;
use std::borrow::Cow;

use crate::error::{QaError, QaResult};

/// Default permission bits for uploaded state files.
pub const DEFAULT_UPLOAD_MODE: u32 = 0o600;

/// Permission bits for uploaded controller stubs.
pub const EXECUTABLE_UPLOAD_MODE: u32 = 0o700;

/// Result of a command execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Exit code of the command.
    pub exit_code: i32,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Execution duration in milliseconds.
    pub duration_ms: u64,
}

impl CommandResult {
    /// Check if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Shorthand for a completed command with no timing information.
    pub fn completed(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            duration_ms: 0,
        }
    }

    /// Turn a non-zero exit into an infrastructure error for `command`.
    pub fn require_success(self, command: &str) -> QaResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(QaError::Command {
                command: command.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Quote a single word for a POSIX shell.
pub fn shell_quote(word: &str) -> String {
    escape(Cow::from(word)).into_owned()
}

/// Quote and join an argument vector into one shell command line.
pub fn shell_join<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|arg| shell_quote(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build an owned argv from string slices.
pub fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

/// Channel running commands on one host and staging files there.
///
/// Implementations must run one command at a time to completion; scenarios
/// depend on each step finishing before the next one starts.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Name of the host commands run on (for logs and reports).
    fn host(&self) -> &str;

    /// Directory receiving freshly uploaded files.
    fn upload_dir(&self) -> &str {
        "/tmp"
    }

    /// Run a shell script, optionally feeding `stdin`.
    async fn run_shell(&self, script: &str, stdin: Option<&str>) -> QaResult<CommandResult>;

    /// Run an argument vector; arguments are shell-quoted.
    async fn run(&self, argv: &[String]) -> QaResult<CommandResult> {
        self.run_shell(&shell_join(argv), None).await
    }

    /// Upload `content` to a fresh, uniquely named file and return its path.
    async fn upload(&self, content: &str, mode: u32) -> QaResult<String> {
        let template = format!("{}/nodeqa.XXXXXXXXXX", self.upload_dir().trim_end_matches('/'));
        let script = format!(
            "umask 077 && tmp=$(mktemp {template}) && chmod {mode:o} \"$tmp\" && cat > \"$tmp\" && echo \"$tmp\"",
            template = shell_quote(&template),
        );
        let result = self
            .run_shell(&script, Some(content))
            .await?
            .require_success("upload")?;
        let path = result.stdout.trim().to_string();
        if path.is_empty() {
            return Err(QaError::Transport(format!(
                "upload to {} returned no path",
                self.host()
            )));
        }
        Ok(path)
    }

    /// Overwrite the whole content of `path`, creating it with `mode`.
    async fn upload_to(&self, path: &str, content: &str, mode: u32) -> QaResult<()> {
        let quoted = shell_quote(path);
        let script = format!("umask 077 && cat > {quoted} && chmod {mode:o} {quoted}");
        self.run_shell(&script, Some(content))
            .await?
            .require_success(&format!("upload to {path}"))?;
        Ok(())
    }

    /// Read a file's content.
    async fn read_file(&self, path: &str) -> QaResult<String> {
        let command = argv(["cat", path]);
        let result = self
            .run(&command)
            .await?
            .require_success(&shell_join(&command))?;
        Ok(result.stdout)
    }

    /// Remove files, ignoring ones that are already gone.
    async fn remove_files(&self, paths: &[String]) -> QaResult<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut command = argv(["rm", "-f"]);
        command.extend(paths.iter().cloned());
        self.run(&command)
            .await?
            .require_success(&shell_join(&command))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/tmp/nodeqa.abc"), "/tmp/nodeqa.abc");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_join(&["gnt-node", "power", "on", "node 1"]), "gnt-node power on 'node 1'");
    }

    #[test]
    fn test_require_success() {
        let ok = CommandResult::completed(0, "out", "");
        assert!(ok.require_success("true").is_ok());

        let failed = CommandResult::completed(2, "", "boom\n");
        match failed.require_success("false") {
            Err(QaError::Command {
                command,
                exit_code,
                stderr,
            }) => {
                assert_eq!(command, "false");
                assert_eq!(exit_code, 2);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_argv_builder() {
        assert_eq!(argv(["rm", "-f"]), vec!["rm".to_string(), "-f".to_string()]);
    }
}
