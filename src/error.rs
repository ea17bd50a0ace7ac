//! Error types for apctl

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Outcome of one teardown step, recorded for `PartialTeardown`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownStep {
    /// Step name ("remove-nat", "remove-isolation", "stop-dhcp", "stop-ap")
    pub step: String,
    /// Failure detail, `None` when the step succeeded
    pub error: Option<String>,
}

impl TeardownStep {
    pub fn ok(step: &str) -> Self {
        Self { step: step.to_string(), error: None }
    }

    pub fn failed(step: &str, error: impl fmt::Display) -> Self {
        Self { step: step.to_string(), error: Some(error.to_string()) }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Error)]
pub enum ApctlError {
    /// Bad request parameters; never reaches the OS
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
    /// net_id not present in configuration
    #[error("Unknown network: {0}")]
    UnknownNetwork(String),
    /// Start on a slot that already runs an instance
    #[error("Network {0} is already active; stop it first")]
    AlreadyActive(String),
    /// Mutation on a slot that has no instance
    #[error("Network {0} is not active")]
    NotActive(String),
    /// Another operation holds the slot
    #[error("Network {0} is busy with another operation")]
    Busy(String),
    /// AP or DHCP daemon never reached its ready state
    #[error("{daemon} failed to start: {detail}")]
    DaemonStartFailed { daemon: String, detail: String },
    /// Firewall mutation failed
    #[error("Rule apply failed: {0}")]
    RuleApplyFailed(String),
    /// Some teardown steps failed; the slot is INACTIVE regardless
    #[error("Partial teardown of {net_id}: {}", describe_steps(.steps))]
    PartialTeardown { net_id: String, steps: Vec<TeardownStep> },
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
    /// Command execution failed
    #[error("{}", describe_command_failure(.cmd, .code, .stderr))]
    CommandFailed { cmd: String, code: Option<i32>, stderr: String },
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn describe_command_failure(cmd: &str, code: &Option<i32>, stderr: &str) -> String {
    match code {
        Some(code) => format!("Command '{}' failed with code {}: {}", cmd, code, stderr.trim()),
        None => format!("Command '{}' failed: {}", cmd, stderr.trim()),
    }
}

fn describe_steps(steps: &[TeardownStep]) -> String {
    steps
        .iter()
        .filter_map(|s| s.error.as_ref().map(|e| format!("{} ({})", s.step, e)))
        .collect::<Vec<_>>()
        .join(", ")
}

impl ApctlError {
    /// Stable condition name, used by callers for status-code mapping
    pub fn condition(&self) -> &'static str {
        match self {
            ApctlError::ValidationFailed(_) => "ValidationFailed",
            ApctlError::UnknownNetwork(_) => "UnknownNetwork",
            ApctlError::AlreadyActive(_) => "AlreadyActive",
            ApctlError::NotActive(_) => "NotActive",
            ApctlError::Busy(_) => "Busy",
            ApctlError::DaemonStartFailed { .. } => "DaemonStartFailed",
            ApctlError::RuleApplyFailed(_) => "RuleApplyFailed",
            ApctlError::PartialTeardown { .. } => "PartialTeardown",
            ApctlError::ConfigError(_) => "ConfigError",
            ApctlError::CommandFailed { .. } => "CommandFailed",
            ApctlError::Io(_) => "Io",
        }
    }
}

impl From<serde_json::Error> for ApctlError {
    fn from(error: serde_json::Error) -> Self {
        ApctlError::ConfigError(error.to_string())
    }
}

pub type ApctlResult<T> = Result<T, ApctlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_names() {
        assert_eq!(ApctlError::Busy("ap-01".into()).condition(), "Busy");
        assert_eq!(
            ApctlError::DaemonStartFailed { daemon: "hostapd".into(), detail: "x".into() }.condition(),
            "DaemonStartFailed"
        );
    }

    #[test]
    fn test_partial_teardown_lists_failed_steps_only() {
        let err = ApctlError::PartialTeardown {
            net_id: "ap-01".into(),
            steps: vec![
                TeardownStep::ok("remove-nat"),
                TeardownStep::failed("stop-dhcp", "still running"),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("stop-dhcp (still running)"));
        assert!(!msg.contains("remove-nat"));
    }

    #[test]
    fn test_command_failed_display() {
        let err = ApctlError::CommandFailed {
            cmd: "iptables -C FORWARD".into(),
            code: Some(1),
            stderr: "Bad rule\n".into(),
        };
        assert_eq!(err.to_string(), "Command 'iptables -C FORWARD' failed with code 1: Bad rule");
    }
}
