//! Node-management scenarios.
//!
//! Thin command sequences over `gnt-node` run on the master node. Each
//! scenario asserts the outcome of every command it issues; the cluster's
//! own behavior is the thing under test.

pub mod storage;

pub use storage::{StorageType, StorageUnit, test_storage};

use tracing::{debug, info};

use crate::config::NodeEntry;
use crate::context::QaContext;
use crate::error::{QaError, QaResult};
use crate::types::Outcome;

/// Fields `gnt-node list` accepts in `--output`.
pub const NODE_FIELDS: &[&str] = &[
    "name",
    "pinst_cnt",
    "pinst_list",
    "sinst_cnt",
    "sinst_list",
    "pip",
    "sip",
    "master",
    "master_candidate",
    "drained",
    "offline",
    "role",
    "group",
    "mtotal",
    "mfree",
    "dtotal",
    "dfree",
    "serial_no",
];

/// Add `node` to the cluster, or re-add it with `readd`.
///
/// Adding a node that is already added, or re-adding one that is not, is a
/// bookkeeping error and no command is issued.
pub async fn add_node(ctx: &QaContext, node: &NodeEntry, readd: bool) -> QaResult<()> {
    let added = ctx.is_added(&node.primary);
    if !readd && added {
        return Err(QaError::Node(format!("Node {} already in cluster", node.primary)));
    }
    if readd && !added {
        return Err(QaError::Node(format!("Node {} not yet in cluster", node.primary)));
    }

    let secondary = node.secondary.as_ref().map(|s| format!("--secondary-ip={s}"));
    let mut args = vec!["add", "--no-ssh-key-check"];
    if let Some(secondary) = &secondary {
        args.push(secondary);
    }
    if readd {
        args.push("--readd");
    }
    args.push(&node.primary);

    ctx.assert_command(&ctx.node_cmd(&args), Outcome::Success)
        .await?;
    ctx.set_added(&node.primary, true);
    Ok(())
}

async fn remove_node(ctx: &QaContext, node: &NodeEntry) -> QaResult<()> {
    ctx.assert_command(&ctx.node_cmd(&["remove", &node.primary]), Outcome::Success)
        .await?;
    ctx.set_added(&node.primary, false);
    Ok(())
}

/// Add every non-master node.
pub async fn add_all(ctx: &QaContext) -> QaResult<()> {
    info!("Adding all nodes to cluster");
    for node in ctx.config().non_master_nodes() {
        add_node(ctx, node, false).await?;
    }
    Ok(())
}

/// Mark every non-master node added without touching the cluster.
///
/// For clusters set up outside of nodeqa.
pub fn mark_added_all(ctx: &QaContext) {
    for node in ctx.config().non_master_nodes() {
        ctx.set_added(&node.primary, true);
    }
}

/// Remove every non-master node.
pub async fn remove_all(ctx: &QaContext) -> QaResult<()> {
    info!("Removing all nodes from cluster");
    for node in ctx.config().non_master_nodes() {
        remove_node(ctx, node).await?;
    }
    Ok(())
}

/// `gnt-node add --readd`
pub async fn readd(ctx: &QaContext, primary: &str) -> QaResult<()> {
    let node = ctx.node(primary)?;
    add_node(ctx, node, true).await
}

/// `gnt-node info`
pub async fn info(ctx: &QaContext) -> QaResult<()> {
    ctx.assert_command(&ctx.node_cmd(&["info"]), Outcome::Success)
        .await?;
    Ok(())
}

/// `gnt-node volumes`
pub async fn volumes(ctx: &QaContext) -> QaResult<()> {
    ctx.assert_command(&ctx.node_cmd(&["volumes"]), Outcome::Success)
        .await?;
    Ok(())
}

/// `gnt-node failover` there and back again.
pub async fn failover(ctx: &QaContext, node: &str, node2: &str) -> QaResult<()> {
    if !get_node_instances(ctx, node2, false).await?.is_empty() {
        return Err(QaError::UnusableNode(format!(
            "Secondary node {node2} has at least one primary instance. \
             This test requires it to have no primary instances."
        )));
    }

    info!(node, node2, "Testing gnt-node failover");
    ctx.assert_command(&ctx.node_cmd(&["failover", "-f", node]), Outcome::Success)
        .await?;
    ctx.assert_command(&ctx.node_cmd(&["failover", "-f", node2]), Outcome::Success)
        .await?;
    Ok(())
}

/// `gnt-node evacuate` onto a third node and back again.
pub async fn evacuate(ctx: &QaContext, node: &str, node2: &str) -> QaResult<()> {
    let reservation = ctx.acquire_node(&[node, node2])?;
    let node3 = reservation.primary().to_string();

    if !get_node_instances(ctx, &node3, true).await?.is_empty() {
        return Err(QaError::UnusableNode(format!(
            "Evacuation node {node3} has at least one secondary instance. \
             This test requires it to have no secondary instances."
        )));
    }

    info!(from = node2, to = %node3, "Testing gnt-node evacuate");
    let to_node3 = format!("--new-secondary={node3}");
    ctx.assert_command(
        &ctx.node_cmd(&["evacuate", "-f", &to_node3, node2]),
        Outcome::Success,
    )
    .await?;

    let back = format!("--new-secondary={node2}");
    ctx.assert_command(
        &ctx.node_cmd(&["evacuate", "-f", &back, &node3]),
        Outcome::Success,
    )
    .await?;
    Ok(())
}

/// Toggle the role flags of `node`, then promote it back to candidate.
pub async fn modify(ctx: &QaContext, node: &str) -> QaResult<()> {
    for flag in ["master-candidate", "drained", "offline"] {
        for value in ["yes", "no"] {
            let setting = format!("--{flag}={value}");
            ctx.assert_command(
                &ctx.node_cmd(&["modify", "--force", &setting, node]),
                Outcome::Success,
            )
            .await?;
        }
    }

    ctx.assert_command(
        &ctx.node_cmd(&["modify", "--master-candidate=yes", "--auto-promote", node]),
        Outcome::Success,
    )
    .await?;
    Ok(())
}

/// `gnt-node list` with every known field, and with an unknown one.
pub async fn list(ctx: &QaContext) -> QaResult<()> {
    ctx.assert_command(&ctx.node_cmd(&["list"]), Outcome::Success)
        .await?;

    for field in NODE_FIELDS.iter().copied() {
        let output = format!("--output={field}");
        ctx.assert_command(&ctx.node_cmd(&["list", &output]), Outcome::Success)
            .await?;
    }

    let all = format!("--output={}", NODE_FIELDS.join(","));
    ctx.assert_command(&ctx.node_cmd(&["list", &all]), Outcome::Success)
        .await?;

    ctx.assert_command(
        &ctx.node_cmd(&["list", "--output=field/does/not/exist"]),
        Outcome::Failure,
    )
    .await?;
    Ok(())
}

/// `gnt-node list-fields` for all, each, and an unknown field.
pub async fn list_fields(ctx: &QaContext) -> QaResult<()> {
    ctx.assert_command(&ctx.node_cmd(&["list-fields"]), Outcome::Success)
        .await?;

    for field in NODE_FIELDS.iter().copied() {
        ctx.assert_command(&ctx.node_cmd(&["list-fields", field]), Outcome::Success)
            .await?;
    }

    ctx.assert_command(
        &ctx.node_cmd(&["list-fields", "field/does/not/exist"]),
        Outcome::Failure,
    )
    .await?;
    Ok(())
}

/// One row of `gnt-instance list --output=name,pnode,snodes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub name: String,
    pub primary_node: String,
    pub secondary_nodes: Vec<String>,
}

impl InstanceRecord {
    /// Parse one `name:pnode:snode1,snode2` line.
    pub fn parse_line(line: &str) -> QaResult<Self> {
        let mut parts = line.trim().split(':');
        let (Some(name), Some(pnode), Some(snodes), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(QaError::Node(format!("malformed instance line: {line:?}")));
        };
        Ok(Self {
            name: name.to_string(),
            primary_node: pnode.to_string(),
            secondary_nodes: snodes
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        })
    }

    pub fn parse_listing(text: &str) -> QaResult<Vec<Self>> {
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(Self::parse_line)
            .collect()
    }

    /// `name:pnode:snodes`, the listing format.
    pub fn to_line(&self) -> String {
        format!(
            "{}:{}:{}",
            self.name,
            self.primary_node,
            self.secondary_nodes.join(",")
        )
    }
}

/// All instances known to the cluster.
pub async fn list_instances(ctx: &QaContext) -> QaResult<Vec<InstanceRecord>> {
    let argv = ctx.instance_cmd(&[
        "list",
        "--no-headers",
        "--separator=:",
        "--output=name,pnode,snodes",
    ]);
    let output = ctx.command_output(&argv).await?;
    InstanceRecord::parse_listing(&output)
}

/// Names of instances using `node` as primary, or as a secondary.
pub async fn get_node_instances(ctx: &QaContext, node: &str, secondaries: bool) -> QaResult<Vec<String>> {
    let names: Vec<String> = list_instances(ctx)
        .await?
        .into_iter()
        .filter(|inst| {
            if secondaries {
                inst.secondary_nodes.iter().any(|s| s == node)
            } else {
                inst.primary_node == node
            }
        })
        .map(|inst| inst.name)
        .collect();
    debug!(node, secondaries, count = names.len(), "instances on node");
    Ok(names)
}
