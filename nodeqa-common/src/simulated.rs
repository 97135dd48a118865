//! In-process model of the cluster manager.
//!
//! [`SimulatedCluster`] answers the `gnt-cluster`, `gnt-node` and
//! `gnt-instance` commands the scenarios issue, keeps an in-memory file table
//! for uploads, `cat` and `rm -f`, and plays the manager's side of the
//! out-of-band protocol: it resolves a node's `oob_program`, invokes the
//! controller and judges the reply. Controllers are either [`InProcessStub`]s
//! handed out by its [`StubFactory`] implementation, or stub scripts
//! uploaded into its file table.
//!
//! A [`ManagerQuirk`] makes the model deviate from the protocol, so tests can
//! check the scenarios notice.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, info};

use crate::config::{DEFAULT_CONTROLLER, QaConfig};
use crate::error::{QaError, QaResult};
use crate::exec::{CommandExecutor, CommandResult, EXECUTABLE_UPLOAD_MODE, shell_join};
use crate::node::storage::{SF_ALLOCATABLE, SO_FIX_CONSISTENCY, StorageType};
use crate::node::{InstanceRecord, NODE_FIELDS};
use crate::oob::controller::{Controller, ControllerOutput, ControllerStub, InProcessStub, StubFactory};
use crate::oob::rules::interpret_reply;
use crate::oob::stub::StubScript;
use crate::types::PowerAction;

/// Ways the simulated manager can break the OOB protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ManagerQuirk {
    #[default]
    None,
    /// Passes the node name before the verb.
    ReorderedArgs,
    /// Treats every controller exit status as success.
    IgnoreExitCode,
    /// Uses the cluster-wide controller even where a node has its own.
    IgnoreNodeOverride,
    /// Applies any node's own controller to every node.
    LeakNodeOverride,
}

/// A node joined to the simulated cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimNode {
    pub name: String,
    pub secondary: Option<String>,
    pub master: bool,
    pub master_candidate: bool,
    pub drained: bool,
    pub offline: bool,
}

impl SimNode {
    fn new(name: &str, secondary: Option<&str>, master: bool) -> Self {
        Self {
            name: name.to_string(),
            secondary: secondary.map(str::to_string),
            master,
            master_candidate: true,
            drained: false,
            offline: false,
        }
    }

    fn role(&self) -> &'static str {
        if self.master {
            "M"
        } else if self.offline {
            "O"
        } else if self.drained {
            "D"
        } else if self.master_candidate {
            "C"
        } else {
            "R"
        }
    }
}

/// A storage unit on a simulated node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimStorage {
    pub node: String,
    pub storage_type: StorageType,
    pub name: String,
    pub size: u64,
    pub used: u64,
    pub allocatable: bool,
}

#[derive(Debug, Clone)]
struct SimFile {
    content: String,
    mode: u32,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    prefix: Vec<String>,
    exit_code: i32,
    stderr: String,
}

#[derive(Default)]
struct SimState {
    files: BTreeMap<String, SimFile>,
    next_file: u64,
    upload_budget: Option<usize>,
    nodes: BTreeMap<String, SimNode>,
    cluster_program: String,
    node_programs: HashMap<String, String>,
    controllers: HashMap<String, Arc<dyn Controller>>,
    stubs: Vec<Arc<InProcessStub>>,
    instances: Vec<InstanceRecord>,
    storage: Vec<SimStorage>,
    journal: Vec<Vec<String>>,
    failures: Vec<InjectedFailure>,
    quirk: ManagerQuirk,
}

impl SimState {
    fn join(&mut self, name: &str, secondary: Option<&str>, master: bool) {
        self.nodes
            .insert(name.to_string(), SimNode::new(name, secondary, master));
        self.storage.retain(|s| s.node != name);
        for (storage_type, unit, size, used) in [
            (StorageType::File, "/srv/ganeti/file-storage", 102_400, 1_024),
            (StorageType::LvmPv, "/dev/sda3", 204_800, 10_240),
            (StorageType::LvmPv, "/dev/sdb1", 204_800, 0),
            (StorageType::LvmVg, "xenvg", 409_600, 10_240),
        ] {
            self.storage.push(SimStorage {
                node: name.to_string(),
                storage_type,
                name: unit.to_string(),
                size,
                used,
                allocatable: true,
            });
        }
    }

    fn joined(&self, name: &str) -> Result<&SimNode, String> {
        self.nodes
            .get(name)
            .ok_or_else(|| format!("prerequisites not met: Node '{name}' is unknown"))
    }

    fn write_file(&mut self, path: &str, content: String, mode: u32) {
        self.files
            .insert(path.to_string(), SimFile { content, mode });
    }

    /// Run an uploaded stub script the way bash would.
    fn execute_script(&mut self, path: &str, args: &[String]) -> CommandResult {
        let Some(file) = self.files.get(path) else {
            return CommandResult::completed(127, "", format!("sh: {path}: not found\n"));
        };
        if file.mode & 0o100 == 0 {
            return CommandResult::completed(126, "", format!("sh: {path}: Permission denied\n"));
        }
        let Some(script) = StubScript::parse(&file.content) else {
            return CommandResult::completed(2, "", format!("sh: {path}: cannot interpret script\n"));
        };

        let mode = self
            .files
            .get(&script.call_log)
            .map_or(0o644, |f| f.mode);
        self.write_file(&script.call_log, format!("{}\n", args.join(" ")), mode);

        let mut stderr = String::new();
        let stdout = match &script.payload {
            None => String::new(),
            Some(payload) => match self.files.get(payload) {
                Some(f) => f.content.clone(),
                None => {
                    stderr.push_str(&format!("cat: {payload}: No such file or directory\n"));
                    String::new()
                }
            },
        };

        let exit_code = match &script.exit_code {
            None => 0,
            Some(exit_file) => match self.files.get(exit_file).map(|f| f.content.trim()) {
                None => {
                    stderr.push_str(&format!("{exit_file}: No such file or directory\n"));
                    1
                }
                Some("") => 0,
                Some(text) => match text.parse::<i64>() {
                    Ok(code) => code.rem_euclid(256) as i32,
                    Err(_) => {
                        stderr.push_str(&format!("exit: {text}: numeric argument required\n"));
                        2
                    }
                },
            },
        };

        CommandResult::completed(exit_code, stdout, stderr)
    }
}

/// Where a power action's controller reply comes from.
enum PowerTarget {
    Object(Arc<dyn Controller>),
    Reply(ControllerOutput),
}

struct PowerCall {
    action: PowerAction,
    node: String,
    args: Vec<String>,
    quirk: ManagerQuirk,
    target: PowerTarget,
}

enum Dispatch {
    Done(CommandResult),
    Power(PowerCall),
}

fn ok(stdout: impl Into<String>) -> Result<String, String> {
    Ok(stdout.into())
}

fn finish(result: Result<String, String>) -> CommandResult {
    match result {
        Ok(stdout) => CommandResult::completed(0, stdout, ""),
        Err(message) => CommandResult::completed(1, "", format!("Failure: {message}\n")),
    }
}

/// Options taking a separate value argument.
const VALUE_OPTIONS: &[&str] = &[
    "--node-parameters",
    "--storage-type",
    "--output",
    "--allocatable",
    "--new-secondary",
    "--separator",
    "--secondary-ip",
];

struct ParsedArgs<'a> {
    options: Vec<(&'a str, Option<&'a str>)>,
    positional: Vec<&'a str>,
}

impl<'a> ParsedArgs<'a> {
    fn parse(args: &'a [String]) -> Result<Self, String> {
        let mut options = Vec::new();
        let mut positional = Vec::new();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if !arg.starts_with('-') {
                positional.push(arg.as_str());
            } else if let Some((name, value)) = arg.split_once('=') {
                options.push((name, Some(value)));
            } else if VALUE_OPTIONS.contains(&arg.as_str()) {
                let value = iter
                    .next()
                    .ok_or_else(|| format!("option {arg} requires an argument"))?;
                options.push((arg.as_str(), Some(value.as_str())));
            } else {
                options.push((arg.as_str(), None));
            }
        }
        Ok(Self {
            options,
            positional,
        })
    }

    fn value(&self, name: &str) -> Option<&'a str> {
        self.options
            .iter()
            .rev()
            .find(|(n, _)| *n == name)
            .and_then(|(_, v)| *v)
    }

    fn flag(&self, name: &str) -> bool {
        self.options.iter().any(|(n, _)| *n == name)
    }

    fn only(&self, allowed: &[&str]) -> Result<(), String> {
        match self.options.iter().find(|(n, _)| !allowed.contains(n)) {
            Some((name, _)) => Err(format!("no such option: {name}")),
            None => Ok(()),
        }
    }

    fn single(&self, what: &str) -> Result<&'a str, String> {
        match self.positional.as_slice() {
            [one] => Ok(one),
            _ => Err(format!("expected exactly one {what}")),
        }
    }
}

fn yes_no(value: &str) -> Result<bool, String> {
    match value {
        "yes" => Ok(true),
        "no" => Ok(false),
        other => Err(format!("invalid boolean value {other:?}, expected yes or no")),
    }
}

fn flag_char(value: bool) -> &'static str {
    if value { "Y" } else { "N" }
}

/// In-process cluster manager implementing [`CommandExecutor`].
pub struct SimulatedCluster {
    host: String,
    upload_dir: String,
    cluster_cli: String,
    node_cli: String,
    instance_cli: String,
    state: Mutex<SimState>,
}

impl SimulatedCluster {
    /// A one-node cluster whose master is `master`, with default CLI names.
    pub fn new(master: &str) -> Self {
        let mut state = SimState {
            cluster_program: DEFAULT_CONTROLLER.to_string(),
            ..SimState::default()
        };
        state.join(master, None, true);
        Self {
            host: master.to_string(),
            upload_dir: "/tmp".to_string(),
            cluster_cli: "gnt-cluster".to_string(),
            node_cli: "gnt-node".to_string(),
            instance_cli: "gnt-instance".to_string(),
            state: Mutex::new(state),
        }
    }

    /// A cluster matching `config`: only the master is joined.
    pub fn from_config(config: &QaConfig) -> QaResult<Self> {
        let master = config.master()?;
        let mut cluster = Self::new(&master.primary);
        let settings = &config.settings;
        cluster.upload_dir = settings.upload_dir.clone();
        cluster.cluster_cli = settings.cluster_cli.clone();
        cluster.node_cli = settings.node_cli.clone();
        cluster.instance_cli = settings.instance_cli.clone();
        cluster
            .lock()
            .join(&master.primary, master.secondary.as_deref(), true);
        Ok(cluster)
    }

    /// Join a node directly, as if it had been added earlier.
    pub fn join_node(&self, name: &str, secondary: Option<&str>) {
        self.lock().join(name, secondary, false);
    }

    pub fn add_instance(&self, name: &str, primary: &str, secondaries: &[&str]) {
        self.lock().instances.push(InstanceRecord {
            name: name.to_string(),
            primary_node: primary.to_string(),
            secondary_nodes: secondaries.iter().map(|s| s.to_string()).collect(),
        });
    }

    pub fn set_quirk(&self, quirk: ManagerQuirk) {
        self.lock().quirk = quirk;
    }

    /// Make every command starting with `prefix` fail.
    pub fn fail_command(&self, prefix: &[&str], exit_code: i32, stderr: &str) {
        self.lock().failures.push(InjectedFailure {
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
            exit_code,
            stderr: stderr.to_string(),
        });
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Allow only `budget` more uploads; later ones fail.
    pub fn set_upload_budget(&self, budget: Option<usize>) {
        self.lock().upload_budget = budget;
    }

    /// Register a controller under an `oob_program` path.
    pub fn register_controller(&self, path: &str, controller: Arc<dyn Controller>) {
        self.lock()
            .controllers
            .insert(path.to_string(), controller);
    }

    /// Every command run so far, oldest first.
    pub fn journal(&self) -> Vec<Vec<String>> {
        self.lock().journal.clone()
    }

    /// Journal entries starting with `prefix`.
    pub fn commands_starting_with(&self, prefix: &[&str]) -> Vec<Vec<String>> {
        self.lock()
            .journal
            .iter()
            .filter(|argv| argv.len() >= prefix.len() && argv.iter().zip(prefix).all(|(a, p)| a == p))
            .cloned()
            .collect()
    }

    pub fn cluster_program(&self) -> String {
        self.lock().cluster_program.clone()
    }

    pub fn node_program(&self, node: &str) -> Option<String> {
        self.lock().node_programs.get(node).cloned()
    }

    pub fn file_paths(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    pub fn file_content(&self, path: &str) -> Option<String> {
        self.lock().files.get(path).map(|f| f.content.clone())
    }

    pub fn file_mode(&self, path: &str) -> Option<u32> {
        self.lock().files.get(path).map(|f| f.mode)
    }

    /// Stubs handed out through [`StubFactory`].
    pub fn in_process_stubs(&self) -> Vec<Arc<InProcessStub>> {
        self.lock().stubs.clone()
    }

    pub fn is_joined(&self, node: &str) -> bool {
        self.lock().nodes.contains_key(node)
    }

    pub fn node_state(&self, node: &str) -> Option<SimNode> {
        self.lock().nodes.get(node).cloned()
    }

    pub fn instances(&self) -> Vec<InstanceRecord> {
        self.lock().instances.clone()
    }

    pub fn storage_units(&self, storage_type: StorageType) -> Vec<SimStorage> {
        self.lock()
            .storage
            .iter()
            .filter(|s| s.storage_type == storage_type)
            .cloned()
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register_stub(&self, log_only: bool) -> Arc<InProcessStub> {
        let mut state = self.lock();
        let path = format!("/sim/controllers/stub-{}", state.stubs.len() + 1);
        let stub = Arc::new(if log_only {
            InProcessStub::log_only(path.clone())
        } else {
            InProcessStub::new(path.clone())
        });
        state.controllers.insert(path, stub.clone());
        state.stubs.push(stub.clone());
        stub
    }

    fn dispatch(&self, argv: &[String]) -> Dispatch {
        let mut state = self.lock();
        state.journal.push(argv.to_vec());

        if let Some(failure) = state
            .failures
            .iter()
            .find(|f| argv.len() >= f.prefix.len() && argv.iter().zip(&f.prefix).all(|(a, p)| a == p))
        {
            debug!(command = %shell_join(argv), "injected failure");
            return Dispatch::Done(CommandResult::completed(
                failure.exit_code,
                "",
                failure.stderr.clone(),
            ));
        }

        let Some((program, args)) = argv.split_first() else {
            return Dispatch::Done(CommandResult::completed(0, "", ""));
        };

        if *program == self.node_cli {
            return self.node_command(&mut state, args);
        }
        let result = if *program == self.cluster_cli {
            finish(cluster_command(&mut state, args))
        } else if *program == self.instance_cli {
            finish(instance_command(&state, args))
        } else {
            match program.as_str() {
                "cat" => cat(&state, args),
                "rm" => rm(&mut state, args),
                path if state.files.contains_key(path) => state.execute_script(path, args),
                other => CommandResult::completed(127, "", format!("sh: {other}: command not found\n")),
            }
        };
        Dispatch::Done(result)
    }

    fn node_command(&self, state: &mut SimState, args: &[String]) -> Dispatch {
        let Some((sub, rest)) = args.split_first() else {
            return Dispatch::Done(finish(Err("missing command".to_string())));
        };
        let result = match ParsedArgs::parse(rest) {
            Err(e) => Err(e),
            Ok(parsed) => match sub.as_str() {
                "power" => return power_command(state, &parsed),
                "add" => node_add(state, &parsed),
                "remove" => node_remove(state, &parsed),
                "info" => node_info(state, &parsed),
                "volumes" => node_volumes(state),
                "modify" => node_modify(state, &parsed),
                "failover" => node_failover(state, &parsed),
                "evacuate" => node_evacuate(state, &parsed),
                "list" => node_list(state, &parsed),
                "list-fields" => node_list_fields(&parsed),
                "list-storage" => list_storage(state, &parsed),
                "modify-storage" => modify_storage(state, &parsed),
                "repair-storage" => repair_storage(state, &parsed),
                other => Err(format!("unknown command '{other}'")),
            },
        };
        Dispatch::Done(finish(result))
    }
}

fn cluster_command(state: &mut SimState, args: &[String]) -> Result<String, String> {
    let Some((sub, rest)) = args.split_first() else {
        return Err("missing command".to_string());
    };
    if sub != "modify" {
        return Err(format!("unknown command '{sub}'"));
    }
    let parsed = ParsedArgs::parse(rest)?;
    parsed.only(&["--node-parameters"])?;
    if let Some(params) = parsed.value("--node-parameters") {
        let program = oob_program_param(params)?;
        info!(program, "cluster OOB program set");
        state.cluster_program = program.to_string();
    }
    ok("")
}

fn oob_program_param(params: &str) -> Result<&str, String> {
    params
        .strip_prefix("oob_program=")
        .filter(|p| !p.is_empty())
        .ok_or_else(|| format!("unsupported node parameters: {params}"))
}

fn instance_command(state: &SimState, args: &[String]) -> Result<String, String> {
    match args.first().map(String::as_str) {
        Some("list") => Ok(state
            .instances
            .iter()
            .map(|i| format!("{}\n", i.to_line()))
            .collect()),
        Some(other) => Err(format!("unknown command '{other}'")),
        None => Err("missing command".to_string()),
    }
}

fn cat(state: &SimState, paths: &[String]) -> CommandResult {
    let mut stdout = String::new();
    let mut stderr = String::new();
    for path in paths {
        match state.files.get(path) {
            Some(file) => stdout.push_str(&file.content),
            None => stderr.push_str(&format!("cat: {path}: No such file or directory\n")),
        }
    }
    CommandResult::completed(if stderr.is_empty() { 0 } else { 1 }, stdout, stderr)
}

fn rm(state: &mut SimState, args: &[String]) -> CommandResult {
    let force = args.first().is_some_and(|a| a == "-f");
    let paths = if force { &args[1..] } else { args };
    let mut stderr = String::new();
    for path in paths {
        if state.files.remove(path).is_none() && !force {
            stderr.push_str(&format!("rm: cannot remove '{path}': No such file or directory\n"));
        }
    }
    CommandResult::completed(if stderr.is_empty() { 0 } else { 1 }, "", stderr)
}

fn power_command(state: &mut SimState, parsed: &ParsedArgs<'_>) -> Dispatch {
    match resolve_power(state, parsed) {
        Ok(call) => Dispatch::Power(call),
        Err(message) => Dispatch::Done(finish(Err(message))),
    }
}

/// Find the controller responsible for a `power` command.
///
/// Script controllers run right away; object controllers are returned so
/// they can be awaited without holding the state lock.
fn resolve_power(state: &mut SimState, parsed: &ParsedArgs<'_>) -> Result<PowerCall, String> {
    parsed.only(&[])?;
    let [action, node] = parsed.positional.as_slice() else {
        return Err("usage: power <on|off|cycle|status> <node>".to_string());
    };
    let action: PowerAction = action.parse()?;
    state.joined(node)?;

    let program = match (state.quirk, state.node_programs.get(*node)) {
        (ManagerQuirk::IgnoreNodeOverride, _) => state.cluster_program.clone(),
        (_, Some(program)) => program.clone(),
        (ManagerQuirk::LeakNodeOverride, None) => state
            .node_programs
            .values()
            .next()
            .unwrap_or(&state.cluster_program)
            .clone(),
        (_, None) => state.cluster_program.clone(),
    };
    if program == DEFAULT_CONTROLLER {
        return Err(format!(
            "prerequisites not met: Node {node} does not support out-of-band handling"
        ));
    }

    let args = match state.quirk {
        ManagerQuirk::ReorderedArgs => vec![node.to_string(), action.controller_verb().to_string()],
        _ => vec![action.controller_verb().to_string(), node.to_string()],
    };
    let target = if let Some(controller) = state.controllers.get(&program) {
        PowerTarget::Object(controller.clone())
    } else if state.files.contains_key(&program) {
        let result = state.execute_script(&program, &args);
        PowerTarget::Reply(ControllerOutput {
            stdout: result.stdout,
            exit_code: result.exit_code,
        })
    } else {
        return Err(format!("OOB program '{program}' not found"));
    };

    Ok(PowerCall {
        action,
        node: node.to_string(),
        args,
        quirk: state.quirk,
        target,
    })
}

/// Judge a controller reply the way the manager does.
fn power_result(call: &PowerCall, output: QaResult<ControllerOutput>) -> CommandResult {
    let mut output = match output {
        Ok(output) => output,
        Err(e) => return finish(Err(format!("OOB program failed: {e}"))),
    };
    if call.quirk == ManagerQuirk::IgnoreExitCode {
        output.exit_code = 0;
    }
    match interpret_reply(call.action, &output) {
        Ok(Some(powered)) => finish(ok(format!(
            "{}: powered {}\n",
            call.node,
            if powered { "on" } else { "off" }
        ))),
        Ok(None) => finish(ok("")),
        Err(reason) => finish(Err(format!("command execution error: {reason}"))),
    }
}

fn node_add(state: &mut SimState, parsed: &ParsedArgs<'_>) -> Result<String, String> {
    parsed.only(&["--no-ssh-key-check", "--secondary-ip", "--readd"])?;
    let name = parsed.single("node name")?;
    let secondary = parsed.value("--secondary-ip");

    if parsed.flag("--readd") {
        state.joined(name)?;
        state.join(name, secondary, false);
        return ok(format!("Readded node {name}\n"));
    }
    if state.nodes.contains_key(name) {
        return Err(format!(
            "prerequisites not met: Node {name} is already in the configuration"
        ));
    }
    state.join(name, secondary, false);
    ok("")
}

fn node_remove(state: &mut SimState, parsed: &ParsedArgs<'_>) -> Result<String, String> {
    parsed.only(&[])?;
    let name = parsed.single("node name")?;
    if state.joined(name)?.master {
        return Err("prerequisites not met: Node is the master node, failover to another node is required".to_string());
    }
    if state
        .instances
        .iter()
        .any(|i| i.primary_node == name || i.secondary_nodes.iter().any(|s| s == name))
    {
        return Err(format!("prerequisites not met: Instances still use node {name}"));
    }
    state.nodes.remove(name);
    state.node_programs.remove(name);
    state.storage.retain(|s| s.node != name);
    ok("")
}

fn node_info(state: &SimState, parsed: &ParsedArgs<'_>) -> Result<String, String> {
    parsed.only(&[])?;
    let names: Vec<&str> = if parsed.positional.is_empty() {
        state.nodes.keys().map(String::as_str).collect()
    } else {
        parsed.positional.clone()
    };

    let mut out = String::new();
    for name in names {
        let node = state.joined(name)?;
        out.push_str(&format!("Node name: {}\n", node.name));
        out.push_str(&format!("  primary ip: {}\n", node.name));
        out.push_str(&format!(
            "  secondary ip: {}\n",
            node.secondary.as_deref().unwrap_or(&node.name)
        ));
        out.push_str(&format!("  master candidate: {}\n", node.master_candidate));
        out.push_str(&format!("  drained: {}\n", node.drained));
        out.push_str(&format!("  offline: {}\n", node.offline));
    }
    Ok(out)
}

fn node_volumes(state: &SimState) -> Result<String, String> {
    let mut out = String::from("Node PhysDev VG Name Size Instance\n");
    for unit in state.storage.iter().filter(|s| s.storage_type == StorageType::LvmPv) {
        out.push_str(&format!("{} {} xenvg - {}M -\n", unit.node, unit.name, unit.size));
    }
    Ok(out)
}

fn node_modify(state: &mut SimState, parsed: &ParsedArgs<'_>) -> Result<String, String> {
    parsed.only(&[
        "--force",
        "--auto-promote",
        "--node-parameters",
        "--master-candidate",
        "--drained",
        "--offline",
    ])?;
    let name = parsed.single("node name")?;
    let mut node = state.joined(name)?.clone();

    let program = parsed
        .value("--node-parameters")
        .map(oob_program_param)
        .transpose()?;

    if let Some(value) = parsed.value("--offline") {
        let offline = yes_no(value)?;
        if offline && node.master {
            return Err("prerequisites not met: The master node cannot be set offline".to_string());
        }
        node.offline = offline;
        if offline {
            node.master_candidate = false;
            node.drained = false;
        }
    }
    if let Some(value) = parsed.value("--drained") {
        let drained = yes_no(value)?;
        if drained && node.master {
            return Err("prerequisites not met: The master node cannot be drained".to_string());
        }
        node.drained = drained;
        if drained {
            node.master_candidate = false;
        }
    }
    if let Some(value) = parsed.value("--master-candidate") {
        let candidate = yes_no(value)?;
        if !candidate && node.master {
            return Err("prerequisites not met: The master node has to be a master candidate".to_string());
        }
        if candidate && (node.offline || node.drained) {
            return Err(format!(
                "prerequisites not met: Node {name} is offline or drained and cannot be promoted"
            ));
        }
        node.master_candidate = candidate;
    }

    state.nodes.insert(name.to_string(), node);
    match program {
        Some(DEFAULT_CONTROLLER) => {
            state.node_programs.remove(name);
        }
        Some(program) => {
            info!(node = name, program, "node OOB program set");
            state
                .node_programs
                .insert(name.to_string(), program.to_string());
        }
        None => {}
    }
    ok(format!("Modified node {name}\n"))
}

fn node_failover(state: &mut SimState, parsed: &ParsedArgs<'_>) -> Result<String, String> {
    parsed.only(&["-f", "--force"])?;
    let name = parsed.single("node name")?;
    state.joined(name)?;

    for instance in state.instances.iter().filter(|i| i.primary_node == name) {
        if instance.secondary_nodes.is_empty() {
            return Err(format!(
                "prerequisites not met: Instance {} has no secondary node",
                instance.name
            ));
        }
    }
    for instance in state.instances.iter_mut().filter(|i| i.primary_node == name) {
        let target = instance.secondary_nodes[0].clone();
        instance.secondary_nodes[0] = std::mem::replace(&mut instance.primary_node, target);
    }
    ok("")
}

fn node_evacuate(state: &mut SimState, parsed: &ParsedArgs<'_>) -> Result<String, String> {
    parsed.only(&["-f", "--force", "--new-secondary"])?;
    let name = parsed.single("node name")?;
    let target = parsed
        .value("--new-secondary")
        .ok_or_else(|| "evacuate requires --new-secondary".to_string())?;
    state.joined(name)?;
    state.joined(target)?;
    if target == name {
        return Err("prerequisites not met: New secondary node is the node being evacuated".to_string());
    }

    for instance in state.instances.iter().filter(|i| i.secondary_nodes.iter().any(|s| s == name)) {
        if instance.primary_node == target {
            return Err(format!(
                "prerequisites not met: Node {target} is the primary node of instance {}",
                instance.name
            ));
        }
    }
    for instance in &mut state.instances {
        for secondary in instance.secondary_nodes.iter_mut().filter(|s| s.as_str() == name) {
            *secondary = target.to_string();
        }
    }
    ok("")
}

fn node_field(state: &SimState, node: &SimNode, field: &str) -> Option<String> {
    let primaries: Vec<&str> = state
        .instances
        .iter()
        .filter(|i| i.primary_node == node.name)
        .map(|i| i.name.as_str())
        .collect();
    let secondaries: Vec<&str> = state
        .instances
        .iter()
        .filter(|i| i.secondary_nodes.contains(&node.name))
        .map(|i| i.name.as_str())
        .collect();
    let vg = state
        .storage
        .iter()
        .filter(|s| s.node == node.name && s.storage_type == StorageType::LvmVg);
    let dtotal: u64 = vg.clone().map(|s| s.size).sum();
    let dfree: u64 = vg.map(|s| s.size - s.used).sum();

    let value = match field {
        "name" | "pip" => node.name.clone(),
        "sip" => node.secondary.clone().unwrap_or_else(|| node.name.clone()),
        "pinst_cnt" => primaries.len().to_string(),
        "pinst_list" => primaries.join(","),
        "sinst_cnt" => secondaries.len().to_string(),
        "sinst_list" => secondaries.join(","),
        "master" => flag_char(node.master).to_string(),
        "master_candidate" => flag_char(node.master_candidate).to_string(),
        "drained" => flag_char(node.drained).to_string(),
        "offline" => flag_char(node.offline).to_string(),
        "role" => node.role().to_string(),
        "group" => "default".to_string(),
        "mtotal" => "4096".to_string(),
        "mfree" => "2048".to_string(),
        "dtotal" => dtotal.to_string(),
        "dfree" => dfree.to_string(),
        "serial_no" => "1".to_string(),
        _ => return None,
    };
    Some(value)
}

fn output_fields<'a>(parsed: &ParsedArgs<'a>, default: &[&'a str], known: &[&str]) -> Result<Vec<&'a str>, String> {
    let fields: Vec<&str> = match parsed.value("--output") {
        Some(list) => list.split(',').collect(),
        None => default.to_vec(),
    };
    let unknown: Vec<&str> = fields
        .iter()
        .copied()
        .filter(|f| !known.contains(f))
        .collect();
    if unknown.is_empty() {
        Ok(fields)
    } else {
        Err(format!("Unknown output fields selected: {}", unknown.join(", ")))
    }
}

fn render_table(parsed: &ParsedArgs<'_>, fields: &[&str], rows: Vec<Vec<String>>) -> String {
    let separator = parsed.value("--separator").unwrap_or(" ");
    let mut out = String::new();
    if !parsed.flag("--no-headers") {
        out.push_str(&fields.join(separator));
        out.push('\n');
    }
    for row in rows {
        out.push_str(&row.join(separator));
        out.push('\n');
    }
    out
}

fn node_list(state: &SimState, parsed: &ParsedArgs<'_>) -> Result<String, String> {
    parsed.only(&["--output", "--separator", "--no-headers"])?;
    let fields = output_fields(
        parsed,
        &["name", "dtotal", "dfree", "mtotal", "mfree", "pinst_cnt", "sinst_cnt"],
        NODE_FIELDS,
    )?;
    let rows = state
        .nodes
        .values()
        .map(|node| {
            fields
                .iter()
                .map(|f| node_field(state, node, f).unwrap_or_default())
                .collect()
        })
        .collect();
    Ok(render_table(parsed, &fields, rows))
}

fn node_list_fields(parsed: &ParsedArgs<'_>) -> Result<String, String> {
    parsed.only(&["--separator", "--no-headers"])?;
    let fields: Vec<&str> = if parsed.positional.is_empty() {
        NODE_FIELDS.to_vec()
    } else {
        parsed.positional.clone()
    };
    if let Some(unknown) = fields.iter().find(|f| !NODE_FIELDS.contains(f)) {
        return Err(format!("Unknown field '{unknown}'"));
    }
    let rows = fields.iter().map(|f| vec![f.to_string()]).collect();
    Ok(render_table(parsed, &["Name"], rows))
}

fn storage_type(parsed: &ParsedArgs<'_>) -> Result<StorageType, String> {
    parsed
        .value("--storage-type")
        .unwrap_or("lvm-pv")
        .parse()
}

fn storage_field(unit: &SimStorage, field: &str) -> String {
    match field {
        "node" => unit.node.clone(),
        "type" => unit.storage_type.to_string(),
        "name" => unit.name.clone(),
        "size" => unit.size.to_string(),
        "used" => unit.used.to_string(),
        "free" => (unit.size - unit.used).to_string(),
        "allocatable" => flag_char(unit.allocatable).to_string(),
        _ => String::new(),
    }
}

fn list_storage(state: &SimState, parsed: &ParsedArgs<'_>) -> Result<String, String> {
    parsed.only(&["--storage-type", "--output", "--separator", "--no-headers"])?;
    let storage_type = storage_type(parsed)?;
    let fields = output_fields(
        parsed,
        &["node", "name", "size", "used", "free", "allocatable"],
        &StorageType::all_fields(),
    )?;
    let rows = state
        .storage
        .iter()
        .filter(|s| s.storage_type == storage_type)
        .map(|unit| fields.iter().map(|f| storage_field(unit, f)).collect())
        .collect();
    Ok(render_table(parsed, &fields, rows))
}

fn storage_unit<'s>(state: &'s mut SimState, parsed: &ParsedArgs<'_>) -> Result<&'s mut SimStorage, String> {
    let [node, kind, name] = parsed.positional.as_slice() else {
        return Err("usage: <node> <storage-type> <name>".to_string());
    };
    let kind: StorageType = kind.parse()?;
    state.joined(node)?;
    state
        .storage
        .iter_mut()
        .find(|s| s.node == *node && s.storage_type == kind && s.name == *name)
        .ok_or_else(|| format!("prerequisites not met: No {kind} storage unit '{name}' on node {node}"))
}

fn modify_storage(state: &mut SimState, parsed: &ParsedArgs<'_>) -> Result<String, String> {
    parsed.only(&["--allocatable"])?;
    let unit = storage_unit(state, parsed)?;
    if let Some(value) = parsed.value("--allocatable") {
        if !unit.storage_type.is_modifiable(SF_ALLOCATABLE) {
            return Err(format!(
                "prerequisites not met: Modifying storage field '{SF_ALLOCATABLE}' is not supported for storage type '{}'",
                unit.storage_type
            ));
        }
        unit.allocatable = yes_no(value)?;
    }
    ok("")
}

fn repair_storage(state: &mut SimState, parsed: &ParsedArgs<'_>) -> Result<String, String> {
    parsed.only(&[])?;
    let unit = storage_unit(state, parsed)?;
    if !unit.storage_type.supports(SO_FIX_CONSISTENCY) {
        return Err(format!(
            "prerequisites not met: Storage units of type '{}' cannot be repaired",
            unit.storage_type
        ));
    }
    ok("")
}

#[async_trait]
impl CommandExecutor for SimulatedCluster {
    fn host(&self) -> &str {
        &self.host
    }

    fn upload_dir(&self) -> &str {
        &self.upload_dir
    }

    async fn run_shell(&self, script: &str, _stdin: Option<&str>) -> QaResult<CommandResult> {
        Err(QaError::Transport(format!(
            "simulated cluster only runs argument vectors, got script: {script}"
        )))
    }

    async fn run(&self, argv: &[String]) -> QaResult<CommandResult> {
        let start = Instant::now();
        let mut result = match self.dispatch(argv) {
            Dispatch::Done(result) => result,
            Dispatch::Power(call) => {
                let output = match &call.target {
                    PowerTarget::Reply(output) => Ok(output.clone()),
                    PowerTarget::Object(controller) => controller.handle_invocation(&call.args).await,
                };
                power_result(&call, output)
            }
        };
        result.duration_ms = start.elapsed().as_millis() as u64;
        debug!(
            command = %shell_join(argv),
            exit_code = result.exit_code,
            "simulated command finished"
        );
        Ok(result)
    }

    async fn upload(&self, content: &str, mode: u32) -> QaResult<String> {
        let mut state = self.lock();
        if let Some(budget) = state.upload_budget.as_mut() {
            if *budget == 0 {
                return Err(QaError::Command {
                    command: "upload".to_string(),
                    exit_code: 1,
                    stderr: "No space left on device".to_string(),
                });
            }
            *budget -= 1;
        }
        state.next_file += 1;
        let path = format!(
            "{}/nodeqa.sim{:06}",
            self.upload_dir.trim_end_matches('/'),
            state.next_file
        );
        state.write_file(&path, content.to_string(), mode);
        Ok(path)
    }

    async fn upload_to(&self, path: &str, content: &str, mode: u32) -> QaResult<()> {
        self.lock().write_file(path, content.to_string(), mode);
        Ok(())
    }
}

#[async_trait]
impl StubFactory for SimulatedCluster {
    async fn create_stub(&self) -> QaResult<Arc<dyn ControllerStub>> {
        Ok(self.register_stub(false))
    }

    async fn create_log_only_stub(&self) -> QaResult<Arc<dyn ControllerStub>> {
        Ok(self.register_stub(true))
    }
}

impl SimulatedCluster {
    /// Upload a stub script directly, bypassing [`RemoteStub`](crate::oob::RemoteStub).
    pub async fn install_script(&self, script: &StubScript) -> QaResult<String> {
        self.upload(&script.render(), EXECUTABLE_UPLOAD_MODE).await
    }
}
