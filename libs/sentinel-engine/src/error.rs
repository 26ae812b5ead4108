//! Error taxonomy for the execution pipeline.
//!
//! Every variant maps onto a [`FailureKind`] so per-submission failures can be
//! handed back to callers as a structured outcome. Only toolchain and scratch
//! unavailability are fatal to a worker; everything else is scoped to one
//! submission.

use sentinel_common::types::{FailureKind, IntakeError, Language, LimitViolation, SubmissionOutcome};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ExecutorError {
    #[error("invalid submission: {0}")]
    InvalidSubmission(#[from] IntakeError),
    #[error("executor overloaded: {0}")]
    Overloaded(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("compilation failed")]
    CompileError { diagnostics: String, truncated: bool },
    #[error("build exceeded its {violation:?} budget")]
    Timeout { violation: LimitViolation },
    #[error("build exceeded its {violation:?} ceiling")]
    LimitExceeded { violation: LimitViolation },
    #[error("cache entry {key} is corrupt: {reason}")]
    CacheCorruption { key: String, reason: String },
    #[error("toolchain for {language} unavailable: {reason}")]
    ToolchainUnavailable { language: Language, reason: String },
    #[error("scratch directory unavailable: {0}")]
    ScratchUnavailable(String),
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        program: String,
        kind: std::io::ErrorKind,
        message: String,
    },
    #[error("submission cancelled")]
    Cancelled,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ExecutorError {
    fn from(err: std::io::Error) -> Self {
        ExecutorError::Io(err.to_string())
    }
}

impl ExecutorError {
    /// Errors that mean the worker itself cannot make progress
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExecutorError::ToolchainUnavailable { .. } | ExecutorError::ScratchUnavailable(_)
        )
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            ExecutorError::InvalidSubmission(_) => FailureKind::InvalidSubmission,
            ExecutorError::Overloaded(_) => FailureKind::Overloaded,
            ExecutorError::ResourceExhausted(_) => FailureKind::ResourceExhausted,
            ExecutorError::Timeout { .. } => FailureKind::Timeout,
            ExecutorError::LimitExceeded { .. } => FailureKind::LimitExceeded,
            ExecutorError::ToolchainUnavailable { .. } => FailureKind::ToolchainUnavailable,
            ExecutorError::ScratchUnavailable(_) => FailureKind::ScratchUnavailable,
            ExecutorError::Cancelled => FailureKind::Cancelled,
            ExecutorError::CompileError { .. }
            | ExecutorError::CacheCorruption { .. }
            | ExecutorError::Spawn { .. }
            | ExecutorError::Io(_)
            | ExecutorError::Internal(_) => FailureKind::Internal,
        }
    }

    /// Structured outcome handed back to the caller
    pub fn into_outcome(self) -> SubmissionOutcome {
        match self {
            ExecutorError::CompileError {
                diagnostics,
                truncated,
            } => SubmissionOutcome::CompileError {
                diagnostics,
                truncated,
            },
            other => SubmissionOutcome::Failed {
                kind: other.kind(),
                message: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ExecutorError::ScratchUnavailable("gone".into()).is_fatal());
        assert!(ExecutorError::ToolchainUnavailable {
            language: Language::Cpp,
            reason: "g++ not found".into()
        }
        .is_fatal());
        assert!(!ExecutorError::ResourceExhausted("quota".into()).is_fatal());
        assert!(!ExecutorError::Cancelled.is_fatal());
    }

    #[test]
    fn test_compile_error_keeps_diagnostics() {
        let outcome = ExecutorError::CompileError {
            diagnostics: "main.cpp:1:1: error: expected unqualified-id".into(),
            truncated: false,
        }
        .into_outcome();

        match outcome {
            SubmissionOutcome::CompileError { diagnostics, .. } => {
                assert!(diagnostics.contains("expected unqualified-id"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_build_timeout_maps_to_timeout_kind() {
        let outcome = ExecutorError::Timeout {
            violation: LimitViolation::WallClock,
        }
        .into_outcome();
        assert!(matches!(
            outcome,
            SubmissionOutcome::Failed {
                kind: FailureKind::Timeout,
                ..
            }
        ));
    }
}
