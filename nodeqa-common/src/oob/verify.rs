//! Call-log verification.

use tracing::{debug, error};

use super::controller::ControllerStub;
use crate::error::{QaError, QaResult};
use crate::exec::CommandExecutor;

/// Compare raw call-log content with the expected invocation.
///
/// Trailing whitespace is ignored; everything else must match byte for byte.
pub fn check_call(raw: &str, expected: &str) -> Result<(), String> {
    let actual = raw.trim_end();
    if actual == expected {
        Ok(())
    } else {
        Err(format!(
            "controller call mismatch: expected {expected:?}, got {actual:?}"
        ))
    }
}

/// A recorded controller call and its verdict.
#[derive(Debug)]
pub struct CheckedCall {
    /// Call-log content without trailing whitespace.
    pub recorded: String,
    pub verdict: QaResult<()>,
}

impl CheckedCall {
    pub fn passed(&self) -> bool {
        self.verdict.is_ok()
    }
}

/// Assert that the stub's last invocation was exactly `expected`.
///
/// The outer error is a failure to read the call log; a mismatch is the
/// `verdict`.
pub async fn assert_call(stub: &dyn ControllerStub, expected: &str, step: &str) -> QaResult<CheckedCall> {
    let raw = stub.recorded_call().await?;
    Ok(CheckedCall {
        recorded: raw.trim_end().to_string(),
        verdict: verdict(&raw, expected, step),
    })
}

/// Assert on a call-log file read through `exec`.
pub async fn assert_call_log(
    exec: &dyn CommandExecutor,
    log_path: &str,
    expected: &str,
    step: &str,
) -> QaResult<()> {
    let raw = exec.read_file(log_path).await?;
    verdict(&raw, expected, step)
}

fn verdict(raw: &str, expected: &str, step: &str) -> QaResult<()> {
    match check_call(raw, expected) {
        Ok(()) => {
            debug!(step, expected, "controller call verified");
            Ok(())
        }
        Err(message) => {
            error!(step, "{}", message);
            Err(QaError::assertion(step, message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::argv;
    use crate::oob::controller::{Controller, InProcessStub};

    #[test]
    fn test_check_call_strips_trailing_whitespace_only() {
        assert!(check_call("power-on node1\n", "power-on node1").is_ok());
        assert!(check_call("power-on node1 \t\n", "power-on node1").is_ok());
        assert!(check_call(" power-on node1", "power-on node1").is_err());
        assert!(check_call("power-on  node1", "power-on node1").is_err());
        assert!(check_call("", "power-on node1").is_err());
    }

    #[tokio::test]
    async fn test_assert_call_names_step() {
        let stub = InProcessStub::new("/sim/verify");
        stub.handle_invocation(&argv(["power-off", "node1"]))
            .await
            .unwrap();

        let checked = assert_call(&stub, "power-off node1", "off").await.unwrap();
        assert!(checked.passed());
        assert_eq!(checked.recorded, "power-off node1");

        let checked = assert_call(&stub, "power-on node1", "on after off").await.unwrap();
        assert!(!checked.passed());
        assert_eq!(checked.recorded, "power-off node1");
        match checked.verdict {
            Err(QaError::Assertion { step, message }) => {
                assert_eq!(step, "on after off");
                assert!(message.contains("power-off node1"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
