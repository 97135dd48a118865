//! Per-run QA context.
//!
//! Holds the configuration, the master node, the command channel and the
//! runtime node bookkeeping (which nodes are part of the cluster, which are
//! reserved by a running scenario). Scenarios receive it explicitly.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info};

use crate::config::{NodeEntry, QaConfig, QaSettings};
use crate::error::{QaError, QaResult};
use crate::exec::{CommandExecutor, CommandResult, shell_join};
use crate::types::Outcome;

/// Shared state for one QA run.
pub struct QaContext {
    config: QaConfig,
    master: NodeEntry,
    exec: Arc<dyn CommandExecutor>,
    added: Mutex<HashMap<String, bool>>,
    reserved: Mutex<HashSet<String>>,
}

impl QaContext {
    /// Validate `config` and bind it to a command channel on the master.
    ///
    /// The master is considered added; every other node starts out removed.
    pub fn new(config: QaConfig, exec: Arc<dyn CommandExecutor>) -> QaResult<Self> {
        config.validate()?;
        let master = config.master()?.clone();
        let added = config
            .nodes
            .iter()
            .map(|n| (n.primary.clone(), n.master))
            .collect();

        info!(
            master = %master.primary,
            host = exec.host(),
            nodes = config.nodes.len(),
            "QA context ready"
        );

        Ok(Self {
            config,
            master,
            exec,
            added: Mutex::new(added),
            reserved: Mutex::new(HashSet::new()),
        })
    }

    pub fn config(&self) -> &QaConfig {
        &self.config
    }

    pub fn settings(&self) -> &QaSettings {
        &self.config.settings
    }

    pub fn master(&self) -> &NodeEntry {
        &self.master
    }

    pub fn executor(&self) -> &Arc<dyn CommandExecutor> {
        &self.exec
    }

    /// Look up a configured node by primary address.
    pub fn node(&self, primary: &str) -> QaResult<&NodeEntry> {
        self.config
            .nodes
            .iter()
            .find(|n| n.primary == primary)
            .ok_or_else(|| QaError::Node(format!("{primary} is not a configured node")))
    }

    /// `<cluster_cli> args...`
    pub fn cluster_cmd(&self, args: &[&str]) -> Vec<String> {
        prefixed(&self.config.settings.cluster_cli, args)
    }

    /// `<node_cli> args...`
    pub fn node_cmd(&self, args: &[&str]) -> Vec<String> {
        prefixed(&self.config.settings.node_cli, args)
    }

    /// `<instance_cli> args...`
    pub fn instance_cmd(&self, args: &[&str]) -> Vec<String> {
        prefixed(&self.config.settings.instance_cli, args)
    }

    /// Run a command on the master without judging its outcome.
    pub async fn run(&self, argv: &[String]) -> QaResult<CommandResult> {
        debug!(host = self.exec.host(), "running: {}", shell_join(argv));
        self.exec.run(argv).await
    }

    /// Run `argv` and require the given outcome.
    ///
    /// A mismatch is an [`QaError::Assertion`] named after the command line.
    pub async fn assert_command(&self, argv: &[String], expect: Outcome) -> QaResult<CommandResult> {
        let command = shell_join(argv);
        let result = self.run(argv).await?;
        let observed = Outcome::from_exit_code(result.exit_code);

        if observed == expect {
            debug!(command = %command, exit_code = result.exit_code, "outcome as expected: {}", expect);
            return Ok(result);
        }

        let message = format!(
            "expected {expect}, got exit code {} - stdout: {}, stderr: {}",
            result.exit_code,
            result.stdout.trim(),
            result.stderr.trim()
        );
        error!(command = %command, "{}", message);
        Err(QaError::assertion(command, message))
    }

    /// Run `argv`, require success, return its stdout.
    pub async fn command_output(&self, argv: &[String]) -> QaResult<String> {
        let result = self.run(argv).await?.require_success(&shell_join(argv))?;
        Ok(result.stdout)
    }

    pub fn is_added(&self, primary: &str) -> bool {
        self.lock_added().get(primary).copied().unwrap_or(false)
    }

    pub fn set_added(&self, primary: &str, added: bool) {
        self.lock_added().insert(primary.to_string(), added);
    }

    /// Enabled nodes currently part of the cluster, master first.
    pub fn added_nodes(&self) -> Vec<&NodeEntry> {
        let added = self.lock_added();
        let mut nodes: Vec<&NodeEntry> = self
            .config
            .nodes
            .iter()
            .filter(|n| n.enabled && added.get(&n.primary).copied().unwrap_or(false))
            .collect();
        nodes.sort_by_key(|n| !n.master);
        nodes
    }

    /// Reserve an added node not listed in `exclude` and not already reserved.
    ///
    /// The reservation is released when the returned guard is dropped.
    pub fn acquire_node(&self, exclude: &[&str]) -> QaResult<NodeReservation<'_>> {
        let candidates = self.added_nodes();
        let mut reserved = self.lock_reserved();
        let node = candidates
            .into_iter()
            .find(|n| !exclude.contains(&n.primary.as_str()) && !reserved.contains(&n.primary))
            .ok_or_else(|| {
                QaError::Node(format!(
                    "no free node available (excluding {})",
                    if exclude.is_empty() {
                        "nothing".to_string()
                    } else {
                        exclude.join(", ")
                    }
                ))
            })?;

        reserved.insert(node.primary.clone());
        debug!(node = %node.primary, "node reserved");
        Ok(NodeReservation { ctx: self, node })
    }

    fn release(&self, primary: &str) {
        self.lock_reserved().remove(primary);
        debug!(node = %primary, "node released");
    }

    fn lock_added(&self) -> MutexGuard<'_, HashMap<String, bool>> {
        self.added.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_reserved(&self) -> MutexGuard<'_, HashSet<String>> {
        self.reserved.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn prefixed(program: &str, args: &[&str]) -> Vec<String> {
    std::iter::once(program)
        .chain(args.iter().copied())
        .map(str::to_string)
        .collect()
}

/// A node held by a scenario; released on drop.
pub struct NodeReservation<'a> {
    ctx: &'a QaContext,
    node: &'a NodeEntry,
}

impl NodeReservation<'_> {
    pub fn node(&self) -> &NodeEntry {
        self.node
    }

    pub fn primary(&self) -> &str {
        &self.node.primary
    }
}

impl Drop for NodeReservation<'_> {
    fn drop(&mut self) {
        self.ctx.release(&self.node.primary);
    }
}
