//! QA configuration loading.
//!
//! A run is described by a TOML file naming the cluster nodes and how to
//! reach the master node.
//!
//! # Configuration File
//!
//! Defaults to `nodeqa.toml` in the current directory. Override with the
//! `NODEQA_CONFIG` environment variable or `--config`.
//!
//! # Example Configuration
//!
//! ```toml
//! [settings]
//! command_timeout_secs = 300
//! cluster_cli = "gnt-cluster"
//! node_cli = "gnt-node"
//! known_hosts = "add"   # strict | add | accept-all
//!
//! [[nodes]]
//! primary = "node1.example.com"
//! secondary = "192.168.2.1"
//! master = true
//!
//! [[nodes]]
//! primary = "node2.example.com"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::exec::KnownHostsPolicy;

/// Environment variable to override config file location.
pub const ENV_CONFIG: &str = "NODEQA_CONFIG";

/// Environment variable to override the command timeout.
pub const ENV_TIMEOUT_SECS: &str = "NODEQA_TIMEOUT_SECS";

/// Default config file path relative to the current directory.
pub const DEFAULT_CONFIG_PATH: &str = "nodeqa.toml";

/// Literal `oob_program` value meaning "use the cluster's default controller".
pub const DEFAULT_CONTROLLER: &str = "default";

/// Error type for configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("No nodes configured")]
    NoNodesConfigured,
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Run-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaSettings {
    /// Timeout for a single remote command in seconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// SSH connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Cluster-level CLI.
    #[serde(default = "default_cluster_cli")]
    pub cluster_cli: String,

    /// Node-level CLI.
    #[serde(default = "default_node_cli")]
    pub node_cli: String,

    /// Instance-level CLI, used to check node usability.
    #[serde(default = "default_instance_cli")]
    pub instance_cli: String,

    /// Value restoring the cluster's own controller.
    #[serde(default = "default_controller")]
    pub default_controller: String,

    /// Host key checking for the SSH connection to the master.
    #[serde(default)]
    pub known_hosts: KnownHostsPolicy,

    /// Remote directory receiving uploaded stubs and state files.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,

    /// Number of storage units exercised per storage type.
    #[serde(default = "default_storage_test_units")]
    pub storage_test_units: usize,
}

impl Default for QaSettings {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            cluster_cli: default_cluster_cli(),
            node_cli: default_node_cli(),
            instance_cli: default_instance_cli(),
            default_controller: default_controller(),
            known_hosts: KnownHostsPolicy::default(),
            upload_dir: default_upload_dir(),
            storage_test_units: default_storage_test_units(),
        }
    }
}

fn default_command_timeout() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_cluster_cli() -> String {
    "gnt-cluster".to_string()
}

fn default_node_cli() -> String {
    "gnt-node".to_string()
}

fn default_instance_cli() -> String {
    "gnt-instance".to_string()
}

fn default_controller() -> String {
    DEFAULT_CONTROLLER.to_string()
}

fn default_upload_dir() -> String {
    "/tmp".to_string()
}

fn default_storage_test_units() -> usize {
    2
}

/// A node of the cluster under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    /// Primary address, also the node name the cluster knows.
    pub primary: String,

    /// Secondary (replication) address.
    #[serde(default)]
    pub secondary: Option<String>,

    /// Whether this node is the cluster master.
    #[serde(default)]
    pub master: bool,

    /// SSH username for the master connection.
    #[serde(default = "default_user")]
    pub user: String,

    /// SSH port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path to SSH private key.
    #[serde(default = "default_identity_file")]
    pub identity_file: String,

    /// Whether scenarios may use this node.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_user() -> String {
    "root".to_string()
}

fn default_port() -> u16 {
    22
}

fn default_identity_file() -> String {
    "~/.ssh/id_rsa".to_string()
}

fn default_enabled() -> bool {
    true
}

impl NodeEntry {
    /// Minimal entry for a node reachable by `primary`.
    pub fn new(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            secondary: None,
            master: false,
            user: default_user(),
            port: default_port(),
            identity_file: default_identity_file(),
            enabled: true,
        }
    }

    pub fn with_master(mut self, master: bool) -> Self {
        self.master = master;
        self
    }

    pub fn with_secondary(mut self, secondary: impl Into<String>) -> Self {
        self.secondary = Some(secondary.into());
        self
    }

    /// Expand tilde in the identity file path.
    pub fn expanded_identity_file(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.identity_file).as_ref())
    }
}

/// Complete QA configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QaConfig {
    #[serde(default)]
    pub settings: QaSettings,

    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
}

impl QaConfig {
    /// Load configuration from the default path or environment override.
    pub fn load() -> ConfigResult<Self> {
        Self::load_from(&get_config_path())
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration text.
    pub fn from_toml(contents: &str) -> ConfigResult<Self> {
        let config: QaConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.nodes.is_empty() {
            return Err(ConfigError::NoNodesConfigured);
        }

        let mut seen: HashMap<&str, usize> = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if node.primary.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Node at index {i} has an empty primary address"
                )));
            }
            if let Some(prev) = seen.insert(&node.primary, i) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate node '{}' at indices {} and {}",
                    node.primary, prev, i
                )));
            }
            if node.secondary.as_deref().is_some_and(|s| s.trim().is_empty()) {
                return Err(ConfigError::ValidationError(format!(
                    "Node '{}' has an empty secondary address",
                    node.primary
                )));
            }
        }

        let masters = self.nodes.iter().filter(|n| n.master).count();
        if masters != 1 {
            return Err(ConfigError::ValidationError(format!(
                "Exactly one master node required, found {masters}"
            )));
        }

        if self.settings.default_controller.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "settings.default_controller must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// The cluster master node.
    pub fn master(&self) -> ConfigResult<&NodeEntry> {
        self.nodes
            .iter()
            .find(|n| n.master)
            .ok_or_else(|| ConfigError::ValidationError("No master node configured".to_string()))
    }

    /// Enabled nodes other than the master.
    pub fn non_master_nodes(&self) -> Vec<&NodeEntry> {
        self.nodes
            .iter()
            .filter(|n| n.enabled && !n.master)
            .collect()
    }

    /// Get the effective command timeout, considering environment override.
    pub fn command_timeout(&self) -> Duration {
        let secs = std::env::var(ENV_TIMEOUT_SECS)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.settings.command_timeout_secs);
        Duration::from_secs(secs)
    }
}

/// Get the configuration file path, considering environment override.
pub fn get_config_path() -> PathBuf {
    if let Ok(override_path) = std::env::var(ENV_CONFIG)
        && !override_path.trim().is_empty()
    {
        return PathBuf::from(shellexpand::tilde(&override_path).as_ref());
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}
