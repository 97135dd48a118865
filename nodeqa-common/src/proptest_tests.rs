//! Property-based tests for the out-of-band protocol rules and stub scripts.

#[cfg(test)]
mod tests {
    use crate::oob::controller::ControllerOutput;
    use crate::oob::rules::{expected_outcome, interpret_reply};
    use crate::oob::stub::StubScript;
    use crate::oob::verify::check_call;
    use crate::types::{Outcome, Payload, PowerAction};
    use proptest::prelude::*;
    use tracing::info;

    fn action_strategy() -> impl Strategy<Value = PowerAction> {
        prop::sample::select(PowerAction::ALL.to_vec())
    }

    fn payload_strategy() -> impl Strategy<Value = Payload> {
        prop_oneof![
            Just(Payload::Empty),
            any::<bool>().prop_map(Payload::powered),
            "[a-z]{1,8}".prop_map(|key| Payload::Json(serde_json::json!({ key: 1 }))),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(512))]

        /// Property: a non-zero exit status fails every action.
        #[test]
        fn nonzero_exit_always_fails(
            action in action_strategy(),
            payload in payload_strategy(),
            exit_code in prop_oneof![1..=255i32, -255..=-1i32],
        ) {
            info!(target: "proptest::oob", "exit {} with {}", exit_code, payload);
            prop_assert_eq!(expected_outcome(action, exit_code, &payload), Outcome::Failure);

            let output = ControllerOutput { stdout: payload.to_contents(), exit_code };
            prop_assert!(interpret_reply(action, &output).is_err());
        }

        /// Property: status succeeds exactly when a boolean power state is served.
        #[test]
        fn status_requires_power_state(payload in payload_strategy()) {
            let outcome = expected_outcome(PowerAction::Status, 0, &payload);
            prop_assert_eq!(outcome == Outcome::Success, payload.power_state().is_some());

            let output = ControllerOutput { stdout: payload.to_contents(), exit_code: 0 };
            let reply = interpret_reply(PowerAction::Status, &output);
            prop_assert_eq!(reply.ok().flatten(), payload.power_state());
        }

        /// Property: on/off/cycle at exit 0 succeed exactly without a payload.
        #[test]
        fn state_changes_reject_payload(
            action in prop::sample::select(vec![PowerAction::On, PowerAction::Off, PowerAction::Cycle]),
            payload in payload_strategy(),
        ) {
            let outcome = expected_outcome(action, 0, &payload);
            prop_assert_eq!(outcome == Outcome::Success, payload.is_empty());
        }

        /// Property: the recorded call matches its expectation modulo trailing whitespace.
        #[test]
        fn call_check_tolerates_trailing_whitespace(
            action in action_strategy(),
            node in "[a-z][a-z0-9.-]{0,20}",
            tail in "[ \t\n]{0,4}",
        ) {
            let expected = action.expected_call(&node);
            let raw = format!("{expected}{tail}");
            prop_assert!(check_call(&raw, &expected).is_ok());
            let shifted = format!(" {raw}");
            prop_assert!(check_call(&shifted, &expected).is_err());
        }

        /// Property: rendered stub scripts parse back to the same paths.
        #[test]
        fn stub_script_paths_survive_quoting(
            log in "/[ -~]{1,30}",
            payload in "/[ -~]{1,30}",
            exit in "/[ -~]{1,30}",
        ) {
            let script = StubScript::full(log, payload, exit);
            prop_assert_eq!(StubScript::parse(&script.render()), Some(script));
        }
    }
}
