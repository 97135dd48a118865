//! The out-of-band power scenario.
//!
//! Binds the cluster to a fresh controller stub, walks the power fixtures
//! against the master node, swaps the master to a per-node controller, and
//! always restores the cluster default afterwards.

use chrono::Utc;
use tracing::{error, info, warn};

use super::controller::{Controller, ControllerStub, StubFactory};
use super::report::{ScenarioRecorder, ScenarioReport, StepRecord};
use super::rules::{expected_outcome, scenario_fixtures};
use super::verify::assert_call;
use crate::context::QaContext;
use crate::error::{QaError, QaResult};
use crate::types::{Outcome, Payload, PowerAction};

/// Stub state as last written by the scenario.
#[derive(Debug, Clone, PartialEq)]
struct InjectedState {
    exit_code: i32,
    payload: Payload,
}

/// Drives `gnt-node power` against controller stubs.
pub struct OutOfBandScenario<'a> {
    ctx: &'a QaContext,
    factory: &'a dyn StubFactory,
    recorder: ScenarioRecorder,
}

impl<'a> OutOfBandScenario<'a> {
    pub const NAME: &'static str = "oob";

    pub fn new(ctx: &'a QaContext, factory: &'a dyn StubFactory) -> Self {
        Self {
            ctx,
            factory,
            recorder: ScenarioRecorder::new(),
        }
    }

    /// Run the scenario. Cleanup runs whatever the body returned.
    pub async fn run(&self) -> QaResult<()> {
        let stub = self.factory.create_stub().await?;
        info!(stub = stub.path(), master = %self.ctx.master().primary, "starting out-of-band scenario");

        let body = self.exercise(stub.as_ref()).await;
        let cleanup = self.restore_cluster(stub.as_ref()).await;
        combine(body, cleanup, "cluster controller")
    }

    /// Run the scenario and summarize it.
    pub async fn run_report(&self) -> ScenarioReport {
        let started_at = Utc::now();
        let result = self.run().await;
        if let Err(e) = &result {
            error!("out-of-band scenario failed: {}", e);
        }
        ScenarioReport::new(
            Self::NAME,
            self.ctx.executor().host(),
            started_at,
            self.steps(),
            &result,
        )
    }

    pub fn steps(&self) -> Vec<StepRecord> {
        self.recorder.steps()
    }

    async fn exercise(&self, stub: &dyn ControllerStub) -> QaResult<()> {
        self.set_cluster_controller(stub.path()).await?;

        let master = self.ctx.master().primary.clone();
        let mut state = InjectedState {
            exit_code: 0,
            payload: Payload::Empty,
        };

        for fixture in scenario_fixtures() {
            info!(fixture = fixture.label, "injecting controller state");
            if let Some(exit_code) = fixture.set_exit_code {
                stub.set_exit_code(exit_code).await?;
                state.exit_code = exit_code;
            }
            if let Some(payload) = &fixture.set_payload {
                stub.set_payload(payload).await?;
                state.payload = payload.clone();
            }

            for action in fixture.actions {
                let expect = expected_outcome(action, state.exit_code, &state.payload);
                let step = format!("power {action} ({})", fixture.label);
                self.power_step(stub, action, &master, expect, &step).await?;
            }
        }

        self.per_node_override(stub, &state).await
    }

    /// Swap the master to a log-only controller and check other nodes keep
    /// using the cluster-wide one.
    async fn per_node_override(&self, cluster_stub: &dyn ControllerStub, state: &InjectedState) -> QaResult<()> {
        let master = self.ctx.master().primary.clone();
        let stub = self.factory.create_log_only_stub().await?;
        info!(stub = stub.path(), node = %master, "binding per-node controller");

        let body = async {
            self.set_node_controller(&master, stub.path()).await?;
            self.power_step(
                stub.as_ref(),
                PowerAction::On,
                &master,
                Outcome::Success,
                "power on (per-node controller)",
            )
            .await?;

            let other = self
                .ctx
                .added_nodes()
                .into_iter()
                .find(|n| !n.master)
                .map(|n| n.primary.clone());
            if let Some(other) = other {
                let expect = expected_outcome(PowerAction::On, state.exit_code, &state.payload);
                self.power_step(
                    cluster_stub,
                    PowerAction::On,
                    &other,
                    expect,
                    "power on other node (cluster controller)",
                )
                .await?;
            } else {
                warn!("no other added node, skipping per-node isolation check");
            }
            Ok::<(), QaError>(())
        }
        .await;

        let reset = self
            .set_node_controller(&master, &self.ctx.settings().default_controller)
            .await;
        let removed = stub.teardown().await;
        combine(body, combine(reset, removed, "per-node stub"), "per-node controller")
    }

    /// Issue one power action and check both contracts.
    async fn power_step(
        &self,
        stub: &dyn ControllerStub,
        action: PowerAction,
        node: &str,
        expect: Outcome,
        step: &str,
    ) -> QaResult<()> {
        let argv = self.ctx.node_cmd(&["power", action.as_str(), node]);
        let result = self.ctx.run(&argv).await?;
        let observed = Outcome::from_exit_code(result.exit_code);

        self.recorder.record(StepRecord {
            step: step.to_string(),
            action: Some(action),
            node: node.to_string(),
            expected: expect,
            exit_code: result.exit_code,
            call_log: None,
            passed: observed == expect,
            timestamp: Utc::now(),
        });

        if observed != expect {
            let message = format!(
                "expected {expect}, got exit code {} - stderr: {}",
                result.exit_code,
                result.stderr.trim()
            );
            error!(step, "{}", message);
            return Err(QaError::assertion(step, message));
        }

        let checked = assert_call(stub, &action.expected_call(node), step).await?;
        self.recorder.annotate_last(checked.recorded, checked.verdict.is_ok());
        checked.verdict
    }

    async fn set_cluster_controller(&self, program: &str) -> QaResult<()> {
        let setting = format!("oob_program={program}");
        let argv = self
            .ctx
            .cluster_cmd(&["modify", "--node-parameters", &setting]);
        self.ctx.assert_command(&argv, Outcome::Success).await?;
        Ok(())
    }

    async fn set_node_controller(&self, node: &str, program: &str) -> QaResult<()> {
        let setting = format!("oob_program={program}");
        let argv = self
            .ctx
            .node_cmd(&["modify", "--node-parameters", &setting, node]);
        self.ctx.assert_command(&argv, Outcome::Success).await?;
        Ok(())
    }

    async fn restore_cluster(&self, stub: &dyn ControllerStub) -> QaResult<()> {
        let reset = self
            .set_cluster_controller(&self.ctx.settings().default_controller)
            .await;
        let removed = stub.teardown().await;
        info!(stub = stub.path(), "restored cluster default controller");
        combine(reset, removed, "controller stub")
    }
}

/// Merge a body result with its cleanup result; the body's error wins.
fn combine(body: QaResult<()>, cleanup: QaResult<()>, what: &str) -> QaResult<()> {
    match (body, cleanup) {
        (Ok(()), cleanup) => cleanup,
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(cleanup_err)) => {
            warn!("cleanup of {} also failed: {}", what, cleanup_err);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_prefers_body_error() {
        let body = Err(QaError::assertion("power on", "mismatch"));
        let cleanup = Err(QaError::Transport("gone".to_string()));
        assert!(matches!(
            combine(body, cleanup, "stub"),
            Err(QaError::Assertion { .. })
        ));

        let cleanup = Err(QaError::Transport("gone".to_string()));
        assert!(matches!(
            combine(Ok(()), cleanup, "stub"),
            Err(QaError::Transport(_))
        ));
        assert!(combine(Ok(()), Ok(()), "stub").is_ok());
    }
}
