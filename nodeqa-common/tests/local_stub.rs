//! File-backed controller stubs on the local host.
//!
//! These tests upload real stub scripts into a scratch directory and run
//! them through `sh`, the same way the cluster manager runs its OOB program.
//! They are skipped when `/bin/bash` is missing, since the full stub uses it.

#![cfg(unix)]

use nodeqa_common::oob::{Controller, ControllerStub, RemoteStub, assert_call_log};
use nodeqa_common::{CommandExecutor, LocalExecutor, Payload, PowerAction, QaError};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn bash_available() -> bool {
    if Path::new("/bin/bash").exists() {
        true
    } else {
        eprintln!("Skipping: /bin/bash not available");
        false
    }
}

fn executor(dir: &TempDir) -> Arc<dyn CommandExecutor> {
    let upload_dir = dir.path().to_string_lossy().into_owned();
    Arc::new(LocalExecutor::new(upload_dir, Duration::from_secs(10)).with_host("node1"))
}

fn args(action: PowerAction, node: &str) -> Vec<String> {
    vec![action.controller_verb().to_string(), node.to_string()]
}

#[tokio::test]
async fn test_stub_serves_injected_state() {
    if !bash_available() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let exec = executor(&dir);
    let stub = RemoteStub::create(exec.clone()).await.unwrap();

    let mode = std::fs::metadata(stub.path()).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o700);

    // Fresh stub: no payload, exit 0.
    let output = stub.handle_invocation(&args(PowerAction::On, "node1")).await.unwrap();
    assert_eq!(output.exit_code, 0);
    assert_eq!(output.stdout, "");
    assert_eq!(stub.recorded_call().await.unwrap(), "power-on node1\n");

    stub.set_exit_code(3).await.unwrap();
    stub.set_payload(&Payload::powered(true)).await.unwrap();
    let output = stub
        .handle_invocation(&args(PowerAction::Status, "node2"))
        .await
        .unwrap();
    assert_eq!(output.exit_code, 3);
    assert_eq!(output.stdout, "{\"powered\":true}");

    assert_call_log(
        exec.as_ref(),
        &stub.script().call_log,
        "power-status node2",
        "status on node2",
    )
    .await
    .unwrap();

    stub.teardown().await.unwrap();
    for path in stub.artifacts() {
        assert!(!Path::new(&path).exists(), "{path} left behind");
    }
}

#[tokio::test]
async fn test_log_only_stub_records_call() {
    let dir = TempDir::new().unwrap();
    let exec = executor(&dir);
    let stub = RemoteStub::create_log_only(exec.clone()).await.unwrap();
    assert!(stub.script().is_log_only());
    assert_eq!(stub.artifacts().len(), 2);

    let output = stub
        .handle_invocation(&args(PowerAction::Cycle, "node1"))
        .await
        .unwrap();
    assert_eq!(output.exit_code, 0);
    assert!(output.stdout.is_empty());

    match assert_call_log(exec.as_ref(), &stub.script().call_log, "power-on node1", "cycle").await {
        Err(QaError::Assertion { step, message }) => {
            assert_eq!(step, "cycle");
            assert!(message.contains("power-cycle node1"));
        }
        other => panic!("unexpected result: {other:?}"),
    }

    // A log-only stub has no state to inject.
    assert!(matches!(stub.set_exit_code(1).await, Err(QaError::Stub(_))));

    stub.teardown().await.unwrap();
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_teardown_tolerates_missing_files() {
    let dir = TempDir::new().unwrap();
    let exec = executor(&dir);
    let stub = RemoteStub::create(exec).await.unwrap();

    std::fs::remove_file(&stub.script().call_log).unwrap();
    stub.teardown().await.unwrap();
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
