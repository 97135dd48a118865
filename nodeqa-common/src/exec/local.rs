//! Local command channel.
//!
//! Runs commands on the machine nodeqa itself runs on, e.g. when nodeqa is
//! started directly on the cluster master, or when file-backed controller
//! stubs are exercised against a scratch directory.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{CommandExecutor, CommandResult};
use crate::error::{QaError, QaResult};

/// Executor spawning `sh -c` on the local host.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    host: String,
    upload_dir: String,
    timeout: Duration,
}

impl LocalExecutor {
    pub fn new(upload_dir: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: "localhost".to_string(),
            upload_dir: upload_dir.into(),
            timeout,
        }
    }

    /// Report commands as running on `host` (the node this process runs on).
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }
}

#[async_trait]
impl CommandExecutor for LocalExecutor {
    fn host(&self) -> &str {
        &self.host
    }

    fn upload_dir(&self) -> &str {
        &self.upload_dir
    }

    async fn run_shell(&self, script: &str, stdin: Option<&str>) -> QaResult<CommandResult> {
        let start = Instant::now();
        debug!("Executing locally: {}", script);

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| QaError::Transport(format!("Failed to spawn sh: {e}")))?;

        let execution = async {
            if let (Some(input), Some(mut handle)) = (stdin, child.stdin.take()) {
                handle.write_all(input.as_bytes()).await?;
                handle.shutdown().await?;
            }

            let stdout_handle = child.stdout.take();
            let stderr_handle = child.stderr.take();

            let stdout_fut = async {
                let mut buf = Vec::new();
                if let Some(mut out) = stdout_handle {
                    out.read_to_end(&mut buf).await?;
                }
                Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).into_owned())
            };
            let stderr_fut = async {
                let mut buf = Vec::new();
                if let Some(mut err) = stderr_handle {
                    err.read_to_end(&mut buf).await?;
                }
                Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).into_owned())
            };

            let (stdout, stderr) = tokio::try_join!(stdout_fut, stderr_fut)?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, stdout, stderr))
        };

        match tokio::time::timeout(self.timeout, execution).await {
            Ok(result) => {
                let (status, stdout, stderr) = result?;
                let duration = start.elapsed();
                Ok(CommandResult {
                    exit_code: status.code().unwrap_or(-1),
                    stdout,
                    stderr,
                    duration_ms: duration.as_millis() as u64,
                })
            }
            Err(_) => {
                warn!("Local command timed out after {:?}", self.timeout);
                Err(QaError::Timeout(self.timeout))
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::exec::{DEFAULT_UPLOAD_MODE, argv};

    fn executor(dir: &std::path::Path) -> LocalExecutor {
        LocalExecutor::new(dir.to_string_lossy(), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_run_captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());

        let ok = exec.run(&argv(["echo", "hello world"])).await.unwrap();
        assert!(ok.success());
        assert_eq!(ok.stdout, "hello world\n");

        let failed = exec.run_shell("echo oops >&2; exit 3", None).await.unwrap();
        assert_eq!(failed.exit_code, 3);
        assert_eq!(failed.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_upload_returns_fresh_paths() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());

        let first = exec.upload("alpha", DEFAULT_UPLOAD_MODE).await.unwrap();
        let second = exec.upload("", DEFAULT_UPLOAD_MODE).await.unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with(&*dir.path().to_string_lossy()));
        assert_eq!(std::fs::read_to_string(&first).unwrap(), "alpha");
        assert_eq!(std::fs::read_to_string(&second).unwrap(), "");

        exec.upload_to(&second, "beta", DEFAULT_UPLOAD_MODE)
            .await
            .unwrap();
        assert_eq!(exec.read_file(&second).await.unwrap(), "beta");

        exec.remove_files(&[first.clone(), second.clone()])
            .await
            .unwrap();
        assert!(!std::path::Path::new(&first).exists());
        assert!(!std::path::Path::new(&second).exists());
    }

    #[tokio::test]
    async fn test_read_missing_file_is_command_error() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let missing = dir.path().join("missing").to_string_lossy().into_owned();
        let err = exec.read_file(&missing).await.unwrap_err();
        assert!(matches!(err, QaError::Command { .. }));
    }

    #[tokio::test]
    async fn test_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let exec = LocalExecutor::new(dir.path().to_string_lossy(), Duration::from_millis(50));
        let err = exec.run_shell("sleep 2", None).await.unwrap_err();
        assert!(matches!(err, QaError::Timeout(_)));
    }
}
