//! Error taxonomy for the build execution pipeline.
//!
//! Recoverable, expected conditions (missing optional tool, missing cache,
//! missing baseline) are absorbed where they occur; everything that prevents
//! producing a usable result surfaces as one of these variants and is
//! converted into a failed `ProfileResult` at the profile boundary. Nothing
//! in this taxonomy terminates the host process.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A required external binary is missing. The hint tells the operator
    /// how to remedy it.
    #[error("{tool} is not available: {hint}")]
    ToolUnavailable { tool: String, hint: String },

    /// A supervised command exceeded its deadline.
    #[error("command timed out after {timeout_secs}s: {command}")]
    CommandTimeout { command: String, timeout_secs: u64 },

    /// Fetch retries and reset recovery were both exhausted.
    #[error("git recovery exhausted for {path}: {detail}")]
    GitRecoveryExhausted { path: PathBuf, detail: String },

    /// Cloning was requested but the pipeline has no credentials.
    #[error("cloning is not configured: {0}")]
    NotConfigured(String),

    /// A stub profile. Callers treat this like any other failure.
    #[error("profile {profile} is not implemented")]
    NotImplemented { profile: String },

    /// A hard pipeline step failed.
    #[error("step {step} failed: {detail}")]
    StepFailed { step: String, detail: String },

    /// A process could not be spawned at all.
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<crate::process::SupervisorError> for PipelineError {
    fn from(err: crate::process::SupervisorError) -> Self {
        match err {
            crate::process::SupervisorError::Spawn { command, source } => {
                Self::Spawn { command, source }
            }
            other => Self::StepFailed {
                step: "spawn".to_string(),
                detail: other.to_string(),
            },
        }
    }
}

impl PipelineError {
    pub fn tool_unavailable(tool: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::ToolUnavailable {
            tool: tool.into(),
            hint: hint.into(),
        }
    }

    pub fn step_failed(step: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::StepFailed {
            step: step.into(),
            detail: detail.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::CommandTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_unavailable_carries_remediation_hint() {
        let err = PipelineError::tool_unavailable("xcrun", "install Xcode command line tools");
        assert!(err.to_string().contains("xcrun"));
        assert!(err.to_string().contains("install Xcode"));
    }

    #[test]
    fn timeout_classification() {
        let err = PipelineError::CommandTimeout {
            command: "npm ci".to_string(),
            timeout_secs: 600,
        };
        assert!(err.is_timeout());
        assert!(!PipelineError::NotConfigured("no token".to_string()).is_timeout());
    }
}
