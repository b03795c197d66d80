//! Error taxonomy for macro loading and step execution.
//!
//! Step failures are typed so the runner (and the CLI exit code) can tell a
//! timeout from a missing reference without looking at messages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The kind of a step failure, as surfaced in run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ReferenceNotFound,
    ReferenceLoadError,
    InvalidParameter,
    MissingReference,
    MatchNotFound,
    MatchTimeout,
    ElementNotFound,
    ScriptError,
    Cancelled,
    ExecutionError,
}

impl ErrorKind {
    /// All kinds, in exit-code order.
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::ReferenceNotFound,
        ErrorKind::ReferenceLoadError,
        ErrorKind::InvalidParameter,
        ErrorKind::MissingReference,
        ErrorKind::MatchNotFound,
        ErrorKind::MatchTimeout,
        ErrorKind::ElementNotFound,
        ErrorKind::ScriptError,
        ErrorKind::Cancelled,
        ErrorKind::ExecutionError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ReferenceNotFound => "ReferenceNotFound",
            ErrorKind::ReferenceLoadError => "ReferenceLoadError",
            ErrorKind::InvalidParameter => "InvalidParameter",
            ErrorKind::MissingReference => "MissingReference",
            ErrorKind::MatchNotFound => "MatchNotFound",
            ErrorKind::MatchTimeout => "MatchTimeout",
            ErrorKind::ElementNotFound => "ElementNotFound",
            ErrorKind::ScriptError => "ScriptError",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::ExecutionError => "ExecutionError",
        }
    }

    /// Process exit code for a run that failed with this kind (10..=19).
    pub fn exit_code(self) -> i32 {
        let ordinal = Self::ALL.iter().position(|k| *k == self).unwrap_or(9);
        10 + ordinal as i32
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Result type for step resolution and execution
pub type StepResult<T> = Result<T, StepError>;

/// A step-local failure. Any of these aborts the run at the current step.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepError {
    #[error("reference not found: {}", .path.display())]
    ReferenceNotFound { path: PathBuf },

    #[error("failed to load reference {}: {reason}", .path.display())]
    ReferenceLoadError { path: PathBuf, reason: String },

    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("step requires {expected} reference")]
    MissingReference { expected: String },

    #[error("no match at confidence {threshold:.2}{}", fmt_best(.best))]
    MatchNotFound { threshold: f64, best: Option<f64> },

    #[error("reference did not appear within {elapsed:?}{}", fmt_best(.best))]
    MatchTimeout { elapsed: Duration, best: Option<f64> },

    #[error("element `{query}` not found within {timeout:?}")]
    ElementNotFound { query: String, timeout: Duration },

    #[error("script failed: {message}")]
    ScriptError { message: String },

    #[error("run cancelled")]
    Cancelled,

    #[error("{message}")]
    Execution { message: String },
}

fn fmt_best(best: &Option<f64>) -> String {
    best.map(|b| format!(" (best confidence {:.3})", b))
        .unwrap_or_default()
}

impl StepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::ReferenceNotFound { .. } => ErrorKind::ReferenceNotFound,
            StepError::ReferenceLoadError { .. } => ErrorKind::ReferenceLoadError,
            StepError::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            StepError::MissingReference { .. } => ErrorKind::MissingReference,
            StepError::MatchNotFound { .. } => ErrorKind::MatchNotFound,
            StepError::MatchTimeout { .. } => ErrorKind::MatchTimeout,
            StepError::ElementNotFound { .. } => ErrorKind::ElementNotFound,
            StepError::ScriptError { .. } => ErrorKind::ScriptError,
            StepError::Cancelled => ErrorKind::Cancelled,
            StepError::Execution { .. } => ErrorKind::ExecutionError,
        }
    }

    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        StepError::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        StepError::Execution {
            message: message.into(),
        }
    }

    /// Best confidence seen by the matcher, if this failure came from one.
    pub fn best_confidence(&self) -> Option<f64> {
        match self {
            StepError::MatchNotFound { best, .. } | StepError::MatchTimeout { best, .. } => *best,
            _ => None,
        }
    }

    /// Time spent waiting, for timeout failures.
    pub fn waited(&self) -> Option<Duration> {
        match self {
            StepError::MatchTimeout { elapsed, .. } => Some(*elapsed),
            StepError::ElementNotFound { timeout, .. } => Some(*timeout),
            _ => None,
        }
    }
}

/// Result type for macro store operations
pub type MacroResult<T> = Result<T, MacroError>;

/// Errors raised while loading or saving a macro file
#[derive(Debug, Error)]
pub enum MacroError {
    #[error("failed to read/write macro file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse macro JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("step {index}: unknown action `{name}`")]
    UnknownAction { index: usize, name: String },

    #[error("step {index}: invalid reference: {reason}")]
    InvalidReference { index: usize, reason: String },

    #[error("step {index}: {reason}")]
    InvalidStep { index: usize, reason: String },
}
