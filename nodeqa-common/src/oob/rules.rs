//! Outcome rules of the manager-to-controller power protocol.
//!
//! | exit code | payload            | on   | off  | cycle | status |
//! |-----------|--------------------|------|------|-------|--------|
//! | 0         | empty              | ok   | ok   | ok    | fail   |
//! | 0         | `{"powered":true}` | fail | fail | fail  | ok     |
//! | non-zero  | any                | fail | fail | fail  | fail   |

use super::controller::ControllerOutput;
use crate::types::{Outcome, Payload, PowerAction};

/// Outcome the caller must observe for `action` given the stub's state.
pub fn expected_outcome(action: PowerAction, exit_code: i32, payload: &Payload) -> Outcome {
    if exit_code != 0 {
        return Outcome::Failure;
    }
    let acceptable = match action {
        PowerAction::Status => payload.power_state().is_some(),
        PowerAction::On | PowerAction::Off | PowerAction::Cycle => payload.is_empty(),
    };
    if acceptable {
        Outcome::Success
    } else {
        Outcome::Failure
    }
}

/// How a conforming manager interprets one controller reply.
///
/// Returns the reported power state for `status`, `None` for the other
/// actions, or the reason the manager rejects the reply.
pub fn interpret_reply(action: PowerAction, output: &ControllerOutput) -> Result<Option<bool>, String> {
    if output.exit_code != 0 {
        return Err(format!(
            "OOB program failed with exit code {}",
            output.exit_code
        ));
    }

    let stdout = output.stdout.trim();
    match action {
        PowerAction::Status => {
            if stdout.is_empty() {
                return Err("OOB program returned no power state".to_string());
            }
            let payload = Payload::from_contents(stdout)
                .map_err(|e| format!("OOB program returned invalid JSON: {e}"))?;
            payload
                .power_state()
                .map(Some)
                .ok_or_else(|| "OOB program reply lacks a boolean 'powered'".to_string())
        }
        PowerAction::On | PowerAction::Off | PowerAction::Cycle => {
            if stdout.is_empty() {
                Ok(None)
            } else {
                Err(format!("OOB program returned unexpected data for {action}"))
            }
        }
    }
}

/// One (exit code, payload) fixture of the power scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct Fixture {
    pub label: &'static str,
    /// Exit code written before the fixture's actions, if it changes.
    pub set_exit_code: Option<i32>,
    /// Payload written before the fixture's actions, if it changes.
    pub set_payload: Option<Payload>,
    /// Actions in the order they are issued.
    pub actions: Vec<PowerAction>,
}

/// The fixture walk of the power scenario, in order.
///
/// Only the state that changes is rewritten, so later fixtures inherit the
/// rest from earlier ones.
pub fn scenario_fixtures() -> Vec<Fixture> {
    use PowerAction::{Cycle, Off, On, Status};

    vec![
        Fixture {
            label: "no payload, exit 0",
            set_exit_code: Some(0),
            set_payload: None,
            actions: vec![On, Off, Cycle, Status],
        },
        Fixture {
            label: "payload, exit 0",
            set_exit_code: None,
            set_payload: Some(Payload::powered(true)),
            actions: vec![Status, On, Off, Cycle],
        },
        Fixture {
            label: "payload, exit 1",
            set_exit_code: Some(1),
            set_payload: None,
            actions: vec![On, Off, Cycle, Status],
        },
        Fixture {
            label: "no payload, exit 1",
            set_exit_code: None,
            set_payload: Some(Payload::Empty),
            actions: vec![On, Off, Cycle, Status],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use PowerAction::{Cycle, Off, On, Status};

    fn reply(stdout: &str, exit_code: i32) -> ControllerOutput {
        ControllerOutput {
            stdout: stdout.to_string(),
            exit_code,
        }
    }

    #[test]
    fn test_expectation_table() {
        let powered = Payload::powered(true);
        let rows = [
            (0, Payload::Empty, [true, true, true, false]),
            (0, powered.clone(), [false, false, false, true]),
            (1, Payload::Empty, [false, false, false, false]),
            (1, powered, [false, false, false, false]),
        ];
        for (exit_code, payload, oks) in rows {
            for (action, ok) in [On, Off, Cycle, Status].into_iter().zip(oks) {
                assert_eq!(
                    expected_outcome(action, exit_code, &payload),
                    Outcome::expect_failure(!ok),
                    "{action} with exit {exit_code} and {payload}"
                );
            }
        }
    }

    #[test]
    fn test_status_needs_boolean_powered() {
        let payload = Payload::Json(serde_json::json!({ "powered": 1 }));
        assert_eq!(expected_outcome(Status, 0, &payload), Outcome::Failure);
        assert_eq!(
            interpret_reply(Status, &reply("{\"powered\": 1}", 0)).unwrap_err(),
            "OOB program reply lacks a boolean 'powered'"
        );
        assert!(
            interpret_reply(Status, &reply("{powered", 0))
                .unwrap_err()
                .starts_with("OOB program returned invalid JSON")
        );
    }

    #[test]
    fn test_interpret_reply() {
        assert_eq!(interpret_reply(On, &reply("", 0)), Ok(None));
        assert_eq!(interpret_reply(Cycle, &reply("\n", 0)), Ok(None));
        assert!(interpret_reply(Off, &reply("{\"powered\":true}", 0)).is_err());
        assert_eq!(
            interpret_reply(Status, &reply("{\"powered\": false}\n", 0)),
            Ok(Some(false))
        );
        assert!(interpret_reply(Status, &reply("", 0)).is_err());
        assert!(interpret_reply(Status, &reply("garbage", 0)).is_err());
        assert!(interpret_reply(Status, &reply("{\"powered\": true}", 1)).is_err());
    }

    #[test]
    fn test_rules_agree() {
        for exit_code in [0, 1, 2] {
            for payload in [Payload::Empty, Payload::powered(true), Payload::powered(false)] {
                for action in PowerAction::ALL {
                    let output = reply(&payload.to_contents(), exit_code);
                    let observed = if interpret_reply(action, &output).is_ok() {
                        Outcome::Success
                    } else {
                        Outcome::Failure
                    };
                    assert_eq!(observed, expected_outcome(action, exit_code, &payload));
                }
            }
        }
    }

    #[test]
    fn test_fixture_walk() {
        let fixtures = scenario_fixtures();
        assert_eq!(fixtures.len(), 4);
        assert!(fixtures.iter().all(|f| f.actions.len() == 4));
        assert_eq!(fixtures[0].set_exit_code, Some(0));
        assert_eq!(fixtures[1].actions[0], Status);
        assert_eq!(fixtures[2].set_payload, None);
        assert_eq!(fixtures[3].set_payload, Some(Payload::Empty));
    }
}
