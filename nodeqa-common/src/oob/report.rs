//! Structured scenario reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::error::{QaError, QaResult};
use crate::types::{Outcome, PowerAction};

/// One executed scenario step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<PowerAction>,
    pub node: String,
    pub expected: Outcome,
    pub exit_code: i32,
    /// Call-log content after the step, when it was checked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_log: Option<String>,
    pub passed: bool,
    pub timestamp: DateTime<Utc>,
}

/// Collects step records while a scenario runs.
#[derive(Debug, Default)]
pub struct ScenarioRecorder {
    steps: Mutex<Vec<StepRecord>>,
}

impl ScenarioRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: StepRecord) {
        self.lock().push(record);
    }

    /// Attach the checked call-log to the most recent step.
    pub fn annotate_last(&self, call_log: String, passed: bool) {
        if let Some(last) = self.lock().last_mut() {
            last.call_log = Some(call_log);
            last.passed &= passed;
        }
    }

    pub fn steps(&self) -> Vec<StepRecord> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<StepRecord>> {
        self.steps.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Pass/fail summary of one scenario.
///
/// A scenario that found no usable node passes with `skipped` set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub host: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub passed: bool,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// The failure came from the harness or transport, not the cluster.
    #[serde(default)]
    pub infrastructure_failure: bool,
    pub steps: Vec<StepRecord>,
}

impl ScenarioReport {
    pub fn new(
        scenario: impl Into<String>,
        host: impl Into<String>,
        started_at: DateTime<Utc>,
        steps: Vec<StepRecord>,
        result: &QaResult<()>,
    ) -> Self {
        let mut report = Self {
            scenario: scenario.into(),
            host: host.into(),
            started_at,
            finished_at: Utc::now(),
            passed: true,
            skipped: false,
            skip_reason: None,
            failure: None,
            infrastructure_failure: false,
            steps,
        };
        match result {
            Ok(()) => {}
            Err(QaError::UnusableNode(reason)) => {
                report.skipped = true;
                report.skip_reason = Some(reason.clone());
            }
            Err(e) => {
                report.passed = false;
                report.failure = Some(e.to_string());
                report.infrastructure_failure = e.is_infrastructure();
            }
        }
        report
    }

    /// Whether later scenarios in a sequence should still run.
    pub fn aborts_sequence(&self) -> bool {
        !self.passed && self.infrastructure_failure
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(|s| !s.passed)
    }

    /// One line for terminal output.
    pub fn summary_line(&self) -> String {
        let verdict = match (self.passed, self.skipped) {
            (true, true) => "SKIP",
            (true, false) => "PASS",
            (false, _) => "FAIL",
        };
        let mut line = format!(
            "[{verdict}] {} on {} ({} steps, {}ms)",
            self.scenario,
            self.host,
            self.steps.len(),
            (self.finished_at - self.started_at).num_milliseconds()
        );
        if let Some(reason) = self.failure.as_ref().or(self.skip_reason.as_ref()) {
            line.push_str(&format!(": {reason}"));
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(step: &str, passed: bool) -> StepRecord {
        StepRecord {
            step: step.to_string(),
            action: Some(PowerAction::On),
            node: "node1".to_string(),
            expected: Outcome::Success,
            exit_code: if passed { 0 } else { 1 },
            call_log: None,
            passed,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_recorder_annotates_last_step() {
        let recorder = ScenarioRecorder::new();
        recorder.record(record("first", true));
        recorder.record(record("second", true));
        recorder.annotate_last("power-off node1".to_string(), false);

        let steps = recorder.steps();
        assert_eq!(steps[0].call_log, None);
        assert_eq!(steps[1].call_log.as_deref(), Some("power-off node1"));
        assert!(!steps[1].passed);
    }

    #[test]
    fn test_report_summary() {
        let ok = ScenarioReport::new("oob", "node1", Utc::now(), vec![record("a", true)], &Ok(()));
        assert!(ok.passed);
        assert!(ok.summary_line().starts_with("[PASS] oob on node1 (1 steps"));

        let err = Err(QaError::assertion("power on", "expected success"));
        let failed = ScenarioReport::new(
            "oob",
            "node1",
            Utc::now(),
            vec![record("a", true), record("b", false)],
            &err,
        );
        assert!(!failed.passed);
        assert!(!failed.skipped);
        assert!(!failed.aborts_sequence());
        assert_eq!(failed.failed_steps().count(), 1);
        assert!(failed.summary_line().contains("expected success"));

        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["passed"], false);
        assert_eq!(json["steps"][1]["action"], "on");
    }

    #[test]
    fn test_unusable_node_is_reported_as_skipped() {
        let result = Err(QaError::UnusableNode("node3 is secondary for web1".to_string()));
        let report = ScenarioReport::new("failover", "node1", Utc::now(), Vec::new(), &result);

        assert!(report.passed);
        assert!(report.skipped);
        assert_eq!(report.failure, None);
        assert!(!report.aborts_sequence());
        assert!(
            report
                .summary_line()
                .starts_with("[SKIP] failover on node1 (0 steps")
        );
        assert!(report.summary_line().ends_with(": node3 is secondary for web1"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["skipped"], true);
        assert_eq!(json["skip_reason"], "node3 is secondary for web1");

        let ok = ScenarioReport::new("failover", "node1", Utc::now(), Vec::new(), &Ok(()));
        assert_eq!(serde_json::to_value(&ok).unwrap()["skipped"], false);
    }

    #[test]
    fn test_infrastructure_failure_aborts_sequence() {
        let result = Err(QaError::Transport("connection reset".to_string()));
        let report = ScenarioReport::new("info", "node1", Utc::now(), Vec::new(), &result);
        assert!(!report.passed);
        assert!(report.infrastructure_failure);
        assert!(report.aborts_sequence());
    }
}
