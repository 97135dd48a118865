//! nodeqa - cluster node QA driver
//!
//! Runs node-management and out-of-band power scenarios against a live
//! cluster, driving its CLI on the master node.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use nodeqa_common::{
    CommandExecutor, LocalExecutor, LogConfig, OutOfBandScenario, QaConfig, QaContext, QaError,
    QaResult, RemoteStubFactory, ScenarioReport, SshExecutor, SshOptions, init_logging, node,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "nodeqa")]
#[command(author, version, about = "Cluster node management and OOB power QA")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the QA configuration file
    #[arg(short, long, global = true, env = "NODEQA_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print scenario reports as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Run commands on this host instead of connecting to the master over SSH
    #[arg(long, global = true)]
    local: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Exercise the out-of-band power contract through stub controllers
    Oob,

    /// Add every configured non-master node
    AddAll,

    /// Remove every configured non-master node
    RemoveAll,

    /// Re-add a node that is already part of the cluster
    Readd { node: String },

    /// gnt-node info
    Info,

    /// gnt-node volumes
    Volumes,

    /// List, modify and repair storage units
    Storage,

    /// Toggle the role flags of a node
    Modify { node: String },

    /// Fail over instances from NODE to NODE2 and back
    Failover { node: String, node2: String },

    /// Move secondaries of NODE2 to a third node and back
    Evacuate { node: String, node2: String },

    /// gnt-node list with every field
    List,

    /// gnt-node list-fields with every field
    ListFields,

    /// Run every scenario in sequence
    All {
        /// Nodes are already joined; skip adding and removing them
        #[arg(long)]
        assume_added: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info");
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    let config = match &cli.config {
        Some(path) => QaConfig::load_from(path),
        None => QaConfig::load(),
    }
    .context("Failed to load QA configuration")?;

    let master = config.master()?.clone();
    let mut ssh = None;
    let exec: Arc<dyn CommandExecutor> = if cli.local {
        Arc::new(
            LocalExecutor::new(config.settings.upload_dir.clone(), config.command_timeout())
                .with_host(master.primary.clone()),
        )
    } else {
        let session = Arc::new(
            SshExecutor::connect(&master, SshOptions::from_config(&config))
                .await
                .with_context(|| format!("Failed to connect to master {}", master.primary))?,
        );
        ssh = Some(session.clone());
        session
    };

    let ctx = QaContext::new(config, exec)?;
    let reports = run_command(&ctx, &cli.command).await;
    drop(ctx);

    if let Some(session) = ssh.and_then(Arc::into_inner)
        && let Err(e) = session.close().await
    {
        warn!("Failed to close SSH session: {}", e);
    }

    print_reports(&reports, cli.json)?;
    // Return rather than exit so the logging guards flush on drop.
    Ok(exit_code(&reports))
}

fn exit_code(reports: &[ScenarioReport]) -> ExitCode {
    if run_failed(reports) {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn run_failed(reports: &[ScenarioReport]) -> bool {
    reports.iter().any(|r| !r.passed)
}

async fn run_command(ctx: &QaContext, command: &Commands) -> Vec<ScenarioReport> {
    // Standalone scenarios run against a cluster that is already set up.
    if !matches!(command, Commands::AddAll | Commands::All { .. }) {
        node::mark_added_all(ctx);
    }

    let report = match command {
        Commands::Oob => run_oob(ctx).await,
        Commands::AddAll => run_step(ctx, "add-all", node::add_all(ctx)).await,
        Commands::RemoveAll => run_step(ctx, "remove-all", node::remove_all(ctx)).await,
        Commands::Readd { node: name } => run_step(ctx, "readd", node::readd(ctx, name)).await,
        Commands::Info => run_step(ctx, "info", node::info(ctx)).await,
        Commands::Volumes => run_step(ctx, "volumes", node::volumes(ctx)).await,
        Commands::Storage => run_step(ctx, "storage", node::test_storage(ctx)).await,
        Commands::Modify { node: name } => run_step(ctx, "modify", node::modify(ctx, name)).await,
        Commands::Failover { node: name, node2 } => {
            run_step(ctx, "failover", node::failover(ctx, name, node2)).await
        }
        Commands::Evacuate { node: name, node2 } => {
            run_step(ctx, "evacuate", node::evacuate(ctx, name, node2)).await
        }
        Commands::List => run_step(ctx, "list", node::list(ctx)).await,
        Commands::ListFields => run_step(ctx, "list-fields", node::list_fields(ctx)).await,
        Commands::All { assume_added } => return run_all(ctx, *assume_added).await,
    };
    vec![report]
}

/// Record a report; false once the sequence must stop.
fn push_report(reports: &mut Vec<ScenarioReport>, report: ScenarioReport) -> bool {
    let aborts = report.aborts_sequence();
    if aborts {
        error!(scenario = %report.scenario, "Infrastructure failure, stopping the sequence");
    }
    reports.push(report);
    !aborts
}

/// The full sequence: membership, inspection, roles, instances, then OOB.
///
/// Cluster assertion failures are reported and the sequence continues; a
/// transport or harness failure stops it.
async fn run_all(ctx: &QaContext, assume_added: bool) -> Vec<ScenarioReport> {
    let mut reports = Vec::new();

    macro_rules! step {
        ($report:expr) => {
            if !push_report(&mut reports, $report) {
                return reports;
            }
        };
    }

    if assume_added {
        node::mark_added_all(ctx);
    } else {
        let report = run_step(ctx, "add-all", node::add_all(ctx)).await;
        let added = report.passed;
        step!(report);
        if !added {
            return reports;
        }
    }

    let others: Vec<String> = ctx
        .added_nodes()
        .into_iter()
        .filter(|n| !n.master)
        .map(|n| n.primary.clone())
        .collect();

    if let Some(first) = others.first() {
        step!(run_step(ctx, "readd", node::readd(ctx, first)).await);
    }
    step!(run_step(ctx, "info", node::info(ctx)).await);
    step!(run_step(ctx, "volumes", node::volumes(ctx)).await);
    step!(run_step(ctx, "storage", node::test_storage(ctx)).await);
    step!(run_step(ctx, "list", node::list(ctx)).await);
    step!(run_step(ctx, "list-fields", node::list_fields(ctx)).await);
    if let Some(first) = others.first() {
        step!(run_step(ctx, "modify", node::modify(ctx, first)).await);
    }

    if let [node_a, node_b, ..] = others.as_slice() {
        step!(run_step(ctx, "failover", node::failover(ctx, node_a, node_b)).await);
        step!(run_step(ctx, "evacuate", node::evacuate(ctx, node_a, node_b)).await);
    } else {
        info!("Fewer than two non-master nodes, skipping failover and evacuate");
    }

    step!(run_oob(ctx).await);

    if !assume_added {
        step!(run_step(ctx, "remove-all", node::remove_all(ctx)).await);
    }
    reports
}

async fn run_oob(ctx: &QaContext) -> ScenarioReport {
    let factory = RemoteStubFactory::new(ctx.executor().clone());
    OutOfBandScenario::new(ctx, &factory).run_report().await
}

/// Run a node scenario and summarize it; unusable nodes mark it skipped.
async fn run_step<F>(ctx: &QaContext, name: &str, scenario: F) -> ScenarioReport
where
    F: std::future::Future<Output = QaResult<()>>,
{
    let started_at = Utc::now();
    info!(scenario = name, "Running scenario");

    let result = scenario.await;
    match &result {
        Ok(()) => {}
        Err(QaError::UnusableNode(reason)) => warn!(scenario = name, "Skipping: {}", reason),
        Err(e) => error!(scenario = name, "Scenario failed: {}", e),
    }
    ScenarioReport::new(name, ctx.executor().host(), started_at, Vec::new(), &result)
}

fn print_reports(reports: &[ScenarioReport], json: bool) -> Result<()> {
    if json {
        let text = match reports {
            [single] => serde_json::to_string_pretty(single)?,
            many => serde_json::to_string_pretty(many)?,
        };
        println!("{text}");
    } else {
        for report in reports {
            println!("{}", report.summary_line());
            for step in report.failed_steps() {
                println!("  failed step: {} (exit code {})", step.step, step.exit_code);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(name: &str, result: QaResult<()>) -> ScenarioReport {
        ScenarioReport::new(name, "node1", Utc::now(), Vec::new(), &result)
    }

    #[test]
    fn test_cli_parses_all_with_assume_added() {
        let cli = Cli::try_parse_from(["nodeqa", "--json", "all", "--assume-added"])
            .expect("cli parse should succeed");
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::All { assume_added: true }));
    }

    #[test]
    fn test_cli_parses_failover_nodes() {
        let cli = Cli::try_parse_from(["nodeqa", "failover", "node2", "node3"])
            .expect("cli parse should succeed");
        match cli.command {
            Commands::Failover { node, node2 } => {
                assert_eq!(node, "node2");
                assert_eq!(node2, "node3");
            }
            _ => panic!("expected failover command"),
        }
    }

    #[test]
    fn test_skipped_scenario_does_not_fail_run() {
        let reports = vec![
            report("info", Ok(())),
            report("failover", Err(QaError::UnusableNode("node3 is busy".to_string()))),
        ];
        assert!(!run_failed(&reports));
        assert!(reports[1].skipped);

        let reports = vec![report("list", Err(QaError::assertion("gnt-node list", "exit code 1")))];
        assert!(run_failed(&reports));
    }

    #[test]
    fn test_infrastructure_failure_stops_sequence() {
        let mut reports = Vec::new();
        assert!(push_report(
            &mut reports,
            report("list", Err(QaError::assertion("gnt-node list", "exit code 1")))
        ));
        assert!(!push_report(
            &mut reports,
            report("info", Err(QaError::Transport("connection reset".to_string())))
        ));
        assert_eq!(reports.len(), 2);
    }
}
