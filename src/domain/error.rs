//! Error kinds for the Conductor worker agent.
//!
//! Each variant carries its own propagation policy: retried locally,
//! surfaced as a rejection, reported as a `RunComplete`, or merely logged.

use thiserror::Error;

/// The single error type propagated out of the domain and application
/// layers.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Fatal, pre-start: the loaded `Config` failed validation. Carries every
    /// violation found, since validation is total.
    #[error("invalid configuration: {}", .violations.join("; "))]
    ConfigInvalid { violations: Vec<String> },

    /// Transport or transient work-rejection error. Retried locally by the
    /// session's reconnect loop, or by the control plane re-sending work.
    #[error("transient error: {0}")]
    Transient(String),

    /// A condition that will never succeed without a different assignment
    /// (e.g. an unsupported execution type). Surfaced with `temporary=false`.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// Failure during the execution pipeline itself (setup failed, executor
    /// crashed, workspace materialisation failed). Reported as
    /// `RunComplete{status=error}`.
    #[error("run error: {0}")]
    RunError(String),

    /// The run's deadline elapsed before completion.
    #[error("run timed out")]
    Timeout,

    /// The run was cancelled (explicit `CancelWork`, drain, or shutdown).
    #[error("run cancelled")]
    Cancelled,

    /// Logged but never propagated to the control plane (e.g. a failed
    /// artifact upload, a failed journal delete).
    #[error("internal warning: {0}")]
    InternalWarning(String),
}

impl AgentError {
    /// Whether a `WorkRejected` built from this error should set
    /// `temporary=true`. Only meaningful for pre-admission errors.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn run_error(msg: impl Into<String>) -> Self {
        Self::RunError(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }
}

pub type AgentResult<T> = Result<T, AgentError>;

impl From<sqlx::Error> for AgentError {
    fn from(err: sqlx::Error) -> Self {
        Self::Transient(format!("database error: {err}"))
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        Self::RunError(format!("io error: {err}"))
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        Self::RunError(format!("serialization error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_invalid_joins_violations() {
        let err = AgentError::ConfigInvalid {
            violations: vec!["max_parallel must be 1-100".into(), "heartbeat interval too low".into()],
        };
        assert_eq!(
            err.to_string(),
            "invalid configuration: max_parallel must be 1-100; heartbeat interval too low"
        );
    }

    #[test]
    fn only_transient_is_temporary() {
        assert!(AgentError::transient("x").is_temporary());
        assert!(!AgentError::permanent("x").is_temporary());
        assert!(!AgentError::run_error("x").is_temporary());
        assert!(!AgentError::Timeout.is_temporary());
        assert!(!AgentError::Cancelled.is_temporary());
    }
}
