//! Common types used across nodeqa components.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Power action understood by the cluster's out-of-band controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    On,
    Off,
    Cycle,
    Status,
}

impl PowerAction {
    /// All actions in the order the scenarios exercise them.
    pub const ALL: [PowerAction; 4] = [
        PowerAction::On,
        PowerAction::Off,
        PowerAction::Cycle,
        PowerAction::Status,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PowerAction::On => "on",
            PowerAction::Off => "off",
            PowerAction::Cycle => "cycle",
            PowerAction::Status => "status",
        }
    }

    /// Verb the manager passes as the controller's first argument.
    pub fn controller_verb(&self) -> &'static str {
        match self {
            PowerAction::On => "power-on",
            PowerAction::Off => "power-off",
            PowerAction::Cycle => "power-cycle",
            PowerAction::Status => "power-status",
        }
    }

    /// The call-log line a single invocation against `node` must produce.
    pub fn expected_call(&self, node: &str) -> String {
        format!("{} {}", self.controller_verb(), node)
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PowerAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on" => Ok(PowerAction::On),
            "off" => Ok(PowerAction::Off),
            "cycle" => Ok(PowerAction::Cycle),
            "status" => Ok(PowerAction::Status),
            other => Err(format!("unknown power action: {other}")),
        }
    }
}

/// Caller-visible outcome of a cluster command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn from_exit_code(exit_code: i32) -> Self {
        if exit_code == 0 {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }

    /// `Failure` when `fail` is set, mirroring `assert_command(.., fail=...)`.
    pub fn expect_failure(fail: bool) -> Self {
        if fail { Outcome::Failure } else { Outcome::Success }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Failure => write!(f, "failure"),
        }
    }
}

/// Simulated device-state response served by a controller stub.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "value")]
pub enum Payload {
    #[default]
    Empty,
    Json(Value),
}

impl Payload {
    /// `{"powered": <powered>}`, the only payload the cluster understands.
    pub fn powered(powered: bool) -> Self {
        Payload::Json(serde_json::json!({ "powered": powered }))
    }

    /// Parse raw file contents; blank text is the empty payload.
    pub fn from_contents(contents: &str) -> Result<Self, serde_json::Error> {
        if contents.trim().is_empty() {
            Ok(Payload::Empty)
        } else {
            serde_json::from_str(contents).map(Payload::Json)
        }
    }

    /// Text written to the payload file.
    pub fn to_contents(&self) -> String {
        match self {
            Payload::Empty => String::new(),
            Payload::Json(value) => value.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }

    /// The power state, if the payload carries one the manager can read.
    pub fn power_state(&self) -> Option<bool> {
        match self {
            Payload::Empty => None,
            Payload::Json(value) => value.get("powered").and_then(Value::as_bool),
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Empty => write!(f, "no payload"),
            Payload::Json(value) => write!(f, "payload {value}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_call_shape() {
        assert_eq!(PowerAction::On.expected_call("node1"), "power-on node1");
        assert_eq!(
            PowerAction::Status.expected_call("node1.example.com"),
            "power-status node1.example.com"
        );
    }

    #[test]
    fn test_action_parse_roundtrip() {
        for action in PowerAction::ALL {
            assert_eq!(action.as_str().parse::<PowerAction>().unwrap(), action);
            assert_eq!(action.controller_verb(), format!("power-{action}"));
        }
        assert!("reset".parse::<PowerAction>().is_err());
    }

    #[test]
    fn test_payload_contents() {
        assert_eq!(Payload::from_contents("").unwrap(), Payload::Empty);
        assert_eq!(Payload::from_contents(" \n").unwrap(), Payload::Empty);
        assert_eq!(
            Payload::from_contents("{\"powered\": true}").unwrap(),
            Payload::powered(true)
        );
        assert!(Payload::from_contents("{not json").is_err());
        assert_eq!(Payload::Empty.to_contents(), "");
        assert_eq!(Payload::powered(false).to_contents(), "{\"powered\":false}");
    }

    #[test]
    fn test_power_state() {
        assert_eq!(Payload::Empty.power_state(), None);
        assert_eq!(Payload::powered(true).power_state(), Some(true));
        assert_eq!(
            Payload::Json(serde_json::json!({ "powered": "yes" })).power_state(),
            None
        );
        assert_eq!(Payload::Json(serde_json::json!([1, 2])).power_state(), None);
    }

    #[test]
    fn test_outcome_helpers() {
        assert_eq!(Outcome::from_exit_code(0), Outcome::Success);
        assert_eq!(Outcome::from_exit_code(2), Outcome::Failure);
        assert_eq!(Outcome::expect_failure(true), Outcome::Failure);
        assert_eq!(Outcome::expect_failure(false), Outcome::Success);
    }
}
