//! Error types shared by every nodeqa scenario.
//!
//! Expected command failures are not errors: scenarios assert them through
//! [`Outcome::Failure`](crate::types::Outcome). An `Assertion` error means the
//! cluster behaved differently from what the scenario step required.

use std::time::Duration;

use crate::config::ConfigError;

/// Error type for harness and scenario operations
#[derive(Debug, thiserror::Error)]
pub enum QaError {
    #[error("Assertion failed in step '{step}': {message}")]
    Assertion { step: String, message: String },

    #[error("Command '{command}' failed with exit code {exit_code}: {stderr}")]
    Command {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Node bookkeeping error: {0}")]
    Node(String),

    #[error("Node unusable for this test: {0}")]
    UnusableNode(String),

    #[error("Controller stub error: {0}")]
    Stub(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl QaError {
    /// Build an assertion failure for a named step.
    pub fn assertion(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Assertion {
            step: step.into(),
            message: message.into(),
        }
    }

    /// True for failures that abort the whole run rather than one scenario.
    pub fn is_infrastructure(&self) -> bool {
        !matches!(self, Self::Assertion { .. } | Self::UnusableNode(_))
    }
}

/// Result type for harness operations
pub type QaResult<T> = Result<T, QaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assertion_names_step() {
        let err = QaError::assertion("power status (exit 0, no payload)", "expected failure");
        let text = err.to_string();
        assert!(text.contains("power status (exit 0, no payload)"));
        assert!(text.contains("expected failure"));
        assert!(!err.is_infrastructure());
    }

    #[test]
    fn test_command_error_is_infrastructure() {
        let err = QaError::Command {
            command: "cat /tmp/nodeqa.abc".to_string(),
            exit_code: 1,
            stderr: "No such file or directory".to_string(),
        };
        assert!(err.is_infrastructure());
        assert!(err.to_string().contains("exit code 1"));
    }

    #[test]
    fn test_unusable_node_is_not_infrastructure() {
        assert!(!QaError::UnusableNode("node2 has primaries".to_string()).is_infrastructure());
        assert!(QaError::Transport("connection refused".to_string()).is_infrastructure());
        assert!(QaError::Timeout(Duration::from_secs(1)).is_infrastructure());
    }
}
