//! SSH command channel to the cluster master node.

use async_trait::async_trait;
use openssh::{KnownHosts, Session, SessionBuilder, Stdio};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{CommandExecutor, CommandResult};
use crate::config::{NodeEntry, QaConfig};
use crate::error::{QaError, QaResult};

/// Default SSH connection timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default command execution timeout.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Known hosts policy for SSH connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KnownHostsPolicy {
    /// Strictly verify known hosts.
    Strict,
    /// Add unknown hosts automatically.
    #[default]
    Add,
    /// Accept all hosts without verification (testing only).
    AcceptAll,
}

/// SSH connection options.
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Command execution timeout.
    pub command_timeout: Duration,
    /// Known hosts policy.
    pub known_hosts: KnownHostsPolicy,
    /// Remote directory for uploads.
    pub upload_dir: String,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            known_hosts: KnownHostsPolicy::default(),
            upload_dir: "/tmp".to_string(),
        }
    }
}

impl SshOptions {
    /// Options derived from the QA configuration.
    pub fn from_config(config: &QaConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.settings.connect_timeout_secs),
            command_timeout: config.command_timeout(),
            known_hosts: config.settings.known_hosts,
            upload_dir: config.settings.upload_dir.clone(),
        }
    }
}

/// Executor running commands on a node over an SSH control master.
pub struct SshExecutor {
    node: NodeEntry,
    options: SshOptions,
    session: Session,
}

impl SshExecutor {
    /// Connect to `node`.
    pub async fn connect(node: &NodeEntry, options: SshOptions) -> QaResult<Self> {
        let destination = format!("{}@{}", node.user, node.primary);
        debug!("Connecting to {} via SSH...", destination);

        let known_hosts = match options.known_hosts {
            KnownHostsPolicy::Strict => KnownHosts::Strict,
            KnownHostsPolicy::Add => KnownHosts::Add,
            KnownHostsPolicy::AcceptAll => KnownHosts::Accept,
        };

        let mut builder = SessionBuilder::default();
        builder
            .known_hosts_check(known_hosts)
            .connect_timeout(options.connect_timeout)
            .port(node.port);

        let identity_path = node.expanded_identity_file();
        if Path::new(&identity_path).exists() {
            builder.keyfile(&identity_path);
        }

        let control_dir = if let Some(runtime_dir) = dirs::runtime_dir() {
            runtime_dir.join("nodeqa-ssh")
        } else {
            let username =
                whoami::fallible::username().unwrap_or_else(|_| "unknown".to_string());
            std::env::temp_dir().join(format!("nodeqa-ssh-{}", username))
        };
        if let Err(e) = std::fs::create_dir_all(&control_dir) {
            warn!(
                "Failed to create SSH control directory {:?}: {}",
                control_dir, e
            );
        }
        builder.control_directory(&control_dir);

        let session = builder
            .connect(&destination)
            .await
            .map_err(|e| QaError::Transport(format!("Failed to connect to {destination}: {e}")))?;

        info!("Connected to {}", node.primary);
        Ok(Self {
            node: node.clone(),
            options,
            session,
        })
    }

    /// Close the control master.
    pub async fn close(self) -> QaResult<()> {
        debug!("Disconnecting from {}", self.node.primary);
        self.session
            .close()
            .await
            .map_err(|e| QaError::Transport(format!("Failed to close session: {e}")))
    }
}

#[async_trait]
impl CommandExecutor for SshExecutor {
    fn host(&self) -> &str {
        &self.node.primary
    }

    fn upload_dir(&self) -> &str {
        &self.options.upload_dir
    }

    async fn run_shell(&self, script: &str, stdin: Option<&str>) -> QaResult<CommandResult> {
        let start = Instant::now();
        debug!("Executing on {}: {}", self.node.primary, script);

        let mut child = self
            .session
            .command("sh")
            .arg("-c")
            .arg(script)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .await
            .map_err(|e| {
                QaError::Transport(format!("Failed to spawn command on {}: {e}", self.node.primary))
            })?;

        let execution = async {
            if let (Some(input), Some(mut handle)) = (stdin, child.stdin().take()) {
                handle.write_all(input.as_bytes()).await?;
                handle.shutdown().await?;
            }

            // Read stdout and stderr concurrently so neither pipe can fill up.
            let stdout_handle = child.stdout().take();
            let stderr_handle = child.stderr().take();

            let stdout_fut = async {
                let mut buf = String::new();
                if let Some(mut out) = stdout_handle {
                    out.read_to_string(&mut buf).await?;
                }
                Ok::<String, std::io::Error>(buf)
            };
            let stderr_fut = async {
                let mut buf = String::new();
                if let Some(mut err) = stderr_handle {
                    err.read_to_string(&mut buf).await?;
                }
                Ok::<String, std::io::Error>(buf)
            };

            let (stdout, stderr) = tokio::try_join!(stdout_fut, stderr_fut)?;
            let status = child
                .wait()
                .await
                .map_err(|e| QaError::Transport(format!("Failed to wait for command: {e}")))?;

            Ok::<_, QaError>((status, stdout, stderr))
        };

        match tokio::time::timeout(self.options.command_timeout, execution).await {
            Ok(result) => {
                let (status, stdout, stderr) = result?;
                let duration = start.elapsed();
                let exit_code = status.code().unwrap_or(-1);

                debug!(
                    "Command completed on {} (exit={}, duration={}ms)",
                    self.node.primary,
                    exit_code,
                    duration.as_millis()
                );

                Ok(CommandResult {
                    exit_code,
                    stdout,
                    stderr,
                    duration_ms: duration.as_millis() as u64,
                })
            }
            Err(_) => {
                warn!(
                    "Command timed out on {} after {:?}",
                    self.node.primary, self.options.command_timeout
                );
                Err(QaError::Timeout(self.options.command_timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_options_default() {
        let options = SshOptions::default();
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert_eq!(options.command_timeout, Duration::from_secs(300));
        assert_eq!(options.known_hosts, KnownHostsPolicy::Add);
        assert_eq!(options.upload_dir, "/tmp");
    }

    #[test]
    fn test_ssh_options_from_config() {
        let mut config = QaConfig::default();
        config.settings.connect_timeout_secs = 3;
        config.settings.upload_dir = "/var/tmp".to_string();
        let options = SshOptions::from_config(&config);
        assert_eq!(options.connect_timeout, Duration::from_secs(3));
        assert_eq!(options.known_hosts, KnownHostsPolicy::Add);
        assert_eq!(options.upload_dir, "/var/tmp");
    }

    #[test]
    fn test_ssh_options_follow_known_hosts_setting() {
        let config = QaConfig::from_toml(
            "[settings]\nknown_hosts = \"accept-all\"\n\n[[nodes]]\nprimary = \"node1\"\nmaster = true\n",
        )
        .unwrap();
        assert_eq!(SshOptions::from_config(&config).known_hosts, KnownHostsPolicy::AcceptAll);

        let mut config = QaConfig::default();
        config.settings.known_hosts = KnownHostsPolicy::Strict;
        assert_eq!(SshOptions::from_config(&config).known_hosts, KnownHostsPolicy::Strict);
    }
}
