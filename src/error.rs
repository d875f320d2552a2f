//! Error taxonomy for the integration pipeline.
//!
//! Every failure that can stop a feature maps onto one `ErrorKind`, which
//! decides whether it is retried, needs an operator, or is surfaced as an
//! infrastructure problem.

use crate::config::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification used for retry and reporting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The external generator failed. Retryable.
    Generation,
    /// Generated content is cut off. Needs regeneration or manual completion.
    Truncation,
    /// Merge strategy unknown or risk too high. Needs an operator decision.
    Conflict,
    /// Syntax, import, lint or regression failure after integration.
    CheckpointFailure,
    /// Subprocess timeout, filesystem failure, unavailable tool.
    Infrastructure,
    /// The persisted queue could not be read back.
    CorruptState,
    /// Bad input from the operator (unknown id, illegal transition, bad config).
    Usage,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Generation => "generation",
            ErrorKind::Truncation => "truncation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::CheckpointFailure => "checkpoint",
            ErrorKind::Infrastructure => "infrastructure",
            ErrorKind::CorruptState => "corrupt_state",
            ErrorKind::Usage => "usage",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Error)]
pub enum StitchError {
    #[error("generation failed for {feature_id}: {message}")]
    Generation { feature_id: String, message: String },

    #[error("truncated content in {}: {}", path.display(), issues.join("; "))]
    Truncation { path: PathBuf, issues: Vec<String> },

    #[error("conflict on {}: {reason}", target.display())]
    Conflict { target: PathBuf, reason: String },

    #[error("checkpoint failed: {0}")]
    Checkpoint(String),

    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    #[error("tool not found: {0}")]
    ToolMissing(String),

    #[error("corrupt state file {}: {reason}", path.display())]
    CorruptState { path: PathBuf, reason: String },

    #[error("invalid transition for {feature_id}: {from} -> {to}")]
    InvalidTransition {
        feature_id: String,
        from: String,
        to: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    Usage(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StitchError>;

impl StitchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StitchError::Generation { .. } => ErrorKind::Generation,
            StitchError::Truncation { .. } => ErrorKind::Truncation,
            StitchError::Conflict { .. } => ErrorKind::Conflict,
            StitchError::Checkpoint(_) => ErrorKind::CheckpointFailure,
            StitchError::Infrastructure(_) | StitchError::ToolMissing(_) | StitchError::Io(_) => {
                ErrorKind::Infrastructure
            }
            StitchError::CorruptState { .. } | StitchError::Json(_) => ErrorKind::CorruptState,
            StitchError::InvalidTransition { .. }
            | StitchError::NotFound(_)
            | StitchError::Usage(_)
            | StitchError::Config(_) => ErrorKind::Usage,
        }
    }

    /// Only generator failures are worth an automatic second attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Generation
    }

    pub fn conflict(target: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        StitchError::Conflict {
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn infra(msg: impl Into<String>) -> Self {
        StitchError::Infrastructure(msg.into())
    }
}
