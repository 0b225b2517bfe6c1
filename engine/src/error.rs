//! Error types for the orchestration engine.
//!
//! The primary error type is `EngineError`, returned synchronously by the
//! controller entry points. Failures that happen while a transfer is already
//! running (non-zero exit codes, stderr warnings) are not returned here; they
//! are recorded in the `OperationRecord` and observed by polling.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::model::OperationId;

/// Errors surfaced by the engine's entry points.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing or malformed request field
    #[error("Invalid request: {reason}")]
    Validation { reason: String },

    /// Another operation already occupies the slot
    #[error("An operation is already in progress: {active}")]
    Conflict { active: OperationId },

    /// Source or destination path does not exist
    #[error("Path not found: {}", path.display())]
    PathNotFound { path: PathBuf },

    /// Identifier does not match the active or most recent operation
    #[error("Operation not found or already finished: {id}")]
    OperationNotFound { id: String },

    /// Every `<LABEL>_NNNNN` slot under the date directory is taken
    #[error("No free destination folder for {label} under {}", date_dir.display())]
    PlanningExhausted { date_dir: PathBuf, label: String },

    /// Failed to create a destination directory
    #[error("Failed to create directory: {}", path.display())]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// External tool could not be started
    #[error("Failed to launch {program}: {source}")]
    LaunchFailed {
        program: String,
        #[source]
        source: io::Error,
    },

    /// External transfer tool exited with an unexpected status
    #[error("{program} failed with exit code {}", display_code(*code))]
    RuntimeFailure { program: String, code: Option<i32> },

    /// One-shot command (power control) exited non-zero
    #[error("Command `{command}` failed with exit code {}", display_code(*code))]
    CommandFailed { command: String, code: Option<i32> },

    /// Device enumeration output could not be interpreted
    #[error("Failed to list devices: {reason}")]
    DeviceListing { reason: String },
}

/// Coarse classification of an `EngineError`, for request-handling layers
/// that map failures to responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    PlanningExhausted,
    Launch,
    Runtime,
}

fn display_code(code: Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none (terminated by signal)".to_string(),
    }
}

impl EngineError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// The taxonomy class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::PathNotFound { .. } | Self::OperationNotFound { .. } => ErrorKind::NotFound,
            Self::PlanningExhausted { .. } | Self::DirectoryCreationFailed { .. } => {
                ErrorKind::PlanningExhausted
            }
            Self::LaunchFailed { .. } => ErrorKind::Launch,
            Self::RuntimeFailure { .. } | Self::CommandFailed { .. } | Self::DeviceListing { .. } => {
                ErrorKind::Runtime
            }
        }
    }

    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::DirectoryCreationFailed { source, .. } | Self::LaunchFailed { source, .. } => {
                source.raw_os_error()
            }
            _ => None,
        }
    }
}
