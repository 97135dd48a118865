//! Out-of-band power scenario against the simulated cluster manager.
//!
//! Covers both controller flavors: in-process stubs handed out by the
//! simulator, and stub scripts uploaded into its file table through
//! `RemoteStubFactory`. The manager quirks check that protocol violations
//! are reported and that cleanup still restores the cluster.

use nodeqa_common::oob::{Controller, OutOfBandScenario, RemoteStub, RemoteStubFactory};
use nodeqa_common::{
    CommandExecutor, ManagerQuirk, QaConfig, QaContext, QaError, SimulatedCluster, node,
};
use std::sync::Arc;

const CONFIG: &str = r#"
    [[nodes]]
    primary = "node1"
    master = true

    [[nodes]]
    primary = "node2"

    [[nodes]]
    primary = "node3"
"#;

/// A simulated three-node cluster with every node joined and marked added.
fn cluster() -> (Arc<SimulatedCluster>, QaContext) {
    let config = QaConfig::from_toml(CONFIG).unwrap();
    let sim = Arc::new(SimulatedCluster::from_config(&config).unwrap());
    sim.join_node("node2", None);
    sim.join_node("node3", None);

    let exec: Arc<dyn CommandExecutor> = sim.clone();
    let ctx = QaContext::new(config, exec).unwrap();
    node::mark_added_all(&ctx);
    (sim, ctx)
}

fn assert_restored(sim: &SimulatedCluster) {
    assert_eq!(sim.cluster_program(), "default");
    assert_eq!(sim.node_program("node1"), None);
    assert!(sim.file_paths().is_empty(), "leftover files: {:?}", sim.file_paths());
    assert!(sim.in_process_stubs().iter().all(|s| s.is_removed()));
}

#[tokio::test]
async fn test_scenario_passes_with_in_process_stubs() {
    let (sim, ctx) = cluster();
    let scenario = OutOfBandScenario::new(&ctx, sim.as_ref());

    scenario.run().await.unwrap();

    let steps = scenario.steps();
    assert_eq!(steps.len(), 18);
    assert!(steps.iter().all(|s| s.passed));
    assert_eq!(steps[0].call_log.as_deref(), Some("power-on node1"));
    assert_eq!(steps[3].step, "power status (no payload, exit 0)");
    assert_eq!(steps[17].node, "node2");

    let power_calls = sim.commands_starting_with(&["gnt-node", "power"]);
    assert_eq!(power_calls.len(), 18);

    let stubs = sim.in_process_stubs();
    assert_eq!(stubs.len(), 2);
    let cluster_calls = stubs[0].invocations();
    assert_eq!(cluster_calls.len(), 17);
    assert_eq!(cluster_calls.last().unwrap(), &vec!["power-on".to_string(), "node2".to_string()]);
    assert_eq!(stubs[1].invocations(), vec![vec!["power-on".to_string(), "node1".to_string()]]);

    assert_restored(&sim);
}

#[tokio::test]
async fn test_scenario_passes_with_uploaded_scripts() {
    let (sim, ctx) = cluster();
    let factory = RemoteStubFactory::new(ctx.executor().clone());
    let scenario = OutOfBandScenario::new(&ctx, &factory);

    scenario.run().await.unwrap();

    assert!(scenario.steps().iter().all(|s| s.passed));
    assert_eq!(sim.commands_starting_with(&["cat"]).len(), 18);
    assert_eq!(sim.commands_starting_with(&["rm", "-f"]).len(), 2);
    assert_restored(&sim);
}

#[tokio::test]
async fn test_reordered_arguments_fail_call_check() {
    let (sim, ctx) = cluster();
    sim.set_quirk(ManagerQuirk::ReorderedArgs);
    let factory = RemoteStubFactory::new(ctx.executor().clone());
    let scenario = OutOfBandScenario::new(&ctx, &factory);

    match scenario.run().await {
        Err(QaError::Assertion { step, message }) => {
            assert_eq!(step, "power on (no payload, exit 0)");
            assert!(message.contains("node1 power-on"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    let steps = scenario.steps();
    assert_eq!(steps.len(), 1);
    assert!(!steps[0].passed);
    assert_eq!(steps[0].call_log.as_deref(), Some("node1 power-on"));
    assert_restored(&sim);
}

#[tokio::test]
async fn test_ignored_exit_code_is_detected() {
    let (sim, ctx) = cluster();
    sim.set_quirk(ManagerQuirk::IgnoreExitCode);
    let scenario = OutOfBandScenario::new(&ctx, sim.as_ref());

    match scenario.run().await {
        Err(QaError::Assertion { step, .. }) => {
            assert_eq!(step, "power status (payload, exit 1)");
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_restored(&sim);
}

#[tokio::test]
async fn test_ignored_node_override_is_detected() {
    let (sim, ctx) = cluster();
    sim.set_quirk(ManagerQuirk::IgnoreNodeOverride);
    let scenario = OutOfBandScenario::new(&ctx, sim.as_ref());

    match scenario.run().await {
        Err(QaError::Assertion { step, .. }) => {
            assert_eq!(step, "power on (per-node controller)");
        }
        other => panic!("unexpected result: {other:?}"),
    }
    // The per-node binding is reset even though the step failed.
    let resets = sim.commands_starting_with(&[
        "gnt-node",
        "modify",
        "--node-parameters",
        "oob_program=default",
        "node1",
    ]);
    assert_eq!(resets.len(), 1);
    assert_restored(&sim);
}

#[tokio::test]
async fn test_leaked_node_override_is_detected() {
    let (sim, ctx) = cluster();
    sim.set_quirk(ManagerQuirk::LeakNodeOverride);
    let scenario = OutOfBandScenario::new(&ctx, sim.as_ref());

    match scenario.run().await {
        Err(QaError::Assertion { step, message }) => {
            assert_eq!(step, "power on other node (cluster controller)");
            assert!(message.contains("expected failure"));
        }
        other => panic!("unexpected result: {other:?}"),
    }

    let steps = scenario.steps();
    assert_eq!(steps.len(), 18);
    assert!(steps[16].passed);
    assert_eq!(steps[17].node, "node2");
    assert!(!steps[17].passed);

    // node2's power-on went to the per-node stub, not the cluster one.
    let stubs = sim.in_process_stubs();
    assert_eq!(stubs[0].invocations().len(), 16);
    assert_eq!(
        stubs[1].invocations().last().unwrap(),
        &vec!["power-on".to_string(), "node2".to_string()]
    );
    assert_restored(&sim);
}

#[tokio::test]
async fn test_body_error_wins_over_cleanup_error() {
    let (sim, ctx) = cluster();
    sim.fail_command(&["gnt-cluster", "modify"], 1, "cluster is locked");
    let scenario = OutOfBandScenario::new(&ctx, sim.as_ref());

    match scenario.run().await {
        Err(QaError::Assertion { step, message }) => {
            assert!(step.starts_with("gnt-cluster modify --node-parameters oob_program=/sim/"));
            assert!(message.contains("cluster is locked"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    // Both the bind and the reset were attempted; the stub is gone regardless.
    assert_eq!(sim.commands_starting_with(&["gnt-cluster", "modify"]).len(), 2);
    assert!(sim.in_process_stubs()[0].is_removed());
    assert!(sim.commands_starting_with(&["gnt-node", "power"]).is_empty());
}

#[tokio::test]
async fn test_scenario_without_other_nodes() {
    let config = QaConfig::from_toml("[[nodes]]\nprimary = \"solo\"\nmaster = true\n").unwrap();
    let sim = Arc::new(SimulatedCluster::from_config(&config).unwrap());
    let exec: Arc<dyn CommandExecutor> = sim.clone();
    let ctx = QaContext::new(config, exec).unwrap();

    let scenario = OutOfBandScenario::new(&ctx, sim.as_ref());
    scenario.run().await.unwrap();
    assert_eq!(scenario.steps().len(), 17);
    assert_eq!(sim.cluster_program(), "default");
}

#[tokio::test]
async fn test_report_serializes() {
    let (sim, ctx) = cluster();
    let scenario = OutOfBandScenario::new(&ctx, sim.as_ref());
    let report = scenario.run_report().await;

    assert!(report.passed);
    assert_eq!(report.scenario, "oob");
    assert_eq!(report.host, "node1");
    assert!(report.summary_line().starts_with("[PASS] oob on node1 (18 steps"));

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["steps"].as_array().unwrap().len(), 18);
    assert_eq!(json["steps"][4]["expected"], "success");
    assert_eq!(json["steps"][4]["action"], "status");
}

#[tokio::test]
async fn test_partial_stub_upload_is_cleaned_up() {
    let (sim, ctx) = cluster();
    sim.set_upload_budget(Some(2));

    let result = RemoteStub::create(ctx.executor().clone()).await;
    assert!(matches!(result, Err(QaError::Command { .. })));
    assert!(sim.file_paths().is_empty());

    sim.set_upload_budget(None);
    let stub = RemoteStub::create(ctx.executor().clone()).await.unwrap();
    assert_eq!(sim.file_mode(stub.path()), Some(0o700));
    assert_eq!(sim.file_paths().len(), 4);
}
