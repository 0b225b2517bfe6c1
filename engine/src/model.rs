//! Core data model for transfer operations.
//!
//! This module defines the main data structures:
//! - OperationRecord: the observable state of the single in-flight operation
//! - StartRequest: what a caller hands to the controller
//! - Mode, OperationStatus, OperationId: enums and identifiers

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::Serialize;
use uuid::Uuid;

use crate::error::EngineError;

/// ETA value used before the transfer tool reports one.
pub const ETA_UNKNOWN: &str = "unknown";

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Unique identifier of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn new() -> Self {
        OperationId(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(OperationId)
            .map_err(|_| EngineError::OperationNotFound { id: s.to_string() })
    }
}

/// The kind of transfer to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// One-shot card copy into a fresh dated subdirectory; existing entries are updated
    Copy,
    /// One-way sync into the destination as-is; existing entries are never overwritten
    Sync,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Copy => write!(f, "Copy"),
            Mode::Sync => write!(f, "Sync"),
        }
    }
}

impl FromStr for Mode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "copy" => Ok(Mode::Copy),
            "sync" => Ok(Mode::Sync),
            "" => Err(EngineError::validation("operation mode is required")),
            other => Err(EngineError::validation(format!(
                "invalid mode '{}'; must be 'copy' or 'sync'",
                other
            ))),
        }
    }
}

/// Lifecycle state of the operation slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    #[default]
    Idle,
    Preparing,
    Running,
    Cancelling,
    Completed,
    Error,
    Cancelled,
}

impl OperationStatus {
    /// Returns true while the operation occupies the slot.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OperationStatus::Preparing | OperationStatus::Running | OperationStatus::Cancelling
        )
    }

    /// Returns true if this state is terminal (no further changes expected).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Error | OperationStatus::Cancelled
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationStatus::Idle => "idle",
            OperationStatus::Preparing => "preparing",
            OperationStatus::Running => "running",
            OperationStatus::Cancelling => "cancelling",
            OperationStatus::Completed => "completed",
            OperationStatus::Error => "error",
            OperationStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Observable state of the in-flight (or most recent) operation.
///
/// `id` is `Some` exactly while `status.is_active()`. Once terminal the id is
/// cleared but the rest of the record stays readable until the next start.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationRecord {
    pub id: Option<OperationId>,
    pub status: OperationStatus,
    /// 0..=100, never decreases within one operation
    pub percentage: u8,
    /// Generic description of the current stage, never a file name
    pub current_stage: String,
    /// Elapsed time as reported by the transfer tool
    pub eta: String,
    pub message: String,
    /// Transfer count reported by the tool (`xfr#N`)
    pub files_transferred: u64,
    /// Source size estimate in GB, 0 when unknown
    pub total_gb: f64,
    /// Transferred size estimate in GB, never decreases within one operation
    pub transferred_gb: f64,
    pub mode: Option<Mode>,
    /// Resolved destination (the dated subdirectory for copies)
    pub destination: Option<PathBuf>,
}

impl OperationRecord {
    /// The slot before any operation has been started.
    pub fn idle() -> Self {
        OperationRecord {
            id: None,
            status: OperationStatus::Idle,
            percentage: 0,
            current_stage: "Idle".to_string(),
            eta: ETA_UNKNOWN.to_string(),
            message: String::new(),
            files_transferred: 0,
            total_gb: 0.0,
            transferred_gb: 0.0,
            mode: None,
            destination: None,
        }
    }

    /// Fresh record for a newly accepted operation.
    pub fn preparing(id: OperationId, mode: Mode) -> Self {
        let verb = match mode {
            Mode::Copy => "copy",
            Mode::Sync => "sync",
        };
        OperationRecord {
            id: Some(id),
            status: OperationStatus::Preparing,
            current_stage: "Preparing...".to_string(),
            message: format!("Preparing {}...", verb),
            mode: Some(mode),
            ..Self::idle()
        }
    }

    pub fn total_bytes_estimate(&self) -> u64 {
        gb_to_bytes(self.total_gb)
    }

    pub fn transferred_bytes_estimate(&self) -> u64 {
        gb_to_bytes(self.transferred_gb)
    }
}

impl Default for OperationRecord {
    fn default() -> Self {
        Self::idle()
    }
}

fn gb_to_bytes(gb: f64) -> u64 {
    if gb.is_finite() && gb > 0.0 {
        (gb * BYTES_PER_GB).round() as u64
    } else {
        0
    }
}

/// Parameters of a start request.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub mode: Mode,
    /// Required for `Mode::Copy`
    pub copy_date: Option<NaiveDate>,
    /// Free-text label for the copy folder (camera make, card name...)
    pub label: Option<String>,
}

impl StartRequest {
    pub fn copy(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        copy_date: NaiveDate,
        label: Option<String>,
    ) -> Self {
        StartRequest {
            source: source.into(),
            destination: destination.into(),
            mode: Mode::Copy,
            copy_date: Some(copy_date),
            label,
        }
    }

    pub fn sync(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        StartRequest {
            source: source.into(),
            destination: destination.into(),
            mode: Mode::Sync,
            copy_date: None,
            label: None,
        }
    }

    /// Field-level checks that do not touch the filesystem.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.source.as_os_str().is_empty() {
            return Err(EngineError::validation("source path is required"));
        }
        if self.destination.as_os_str().is_empty() {
            return Err(EngineError::validation("destination path is required"));
        }
        if self.mode == Mode::Copy && self.copy_date.is_none() {
            return Err(EngineError::validation("copy date is required for copy mode"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_activity() {
        assert!(OperationStatus::Preparing.is_active());
        assert!(OperationStatus::Cancelling.is_active());
        assert!(!OperationStatus::Idle.is_active());
        assert!(!OperationStatus::Completed.is_active());
        assert!(OperationStatus::Cancelled.is_terminal());
        assert!(!OperationStatus::Running.is_terminal());
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("copy".parse::<Mode>().unwrap(), Mode::Copy);
        assert_eq!(" SYNC ".parse::<Mode>().unwrap(), Mode::Sync);
        assert!("move".parse::<Mode>().is_err());
        assert!("".parse::<Mode>().is_err());
    }

    #[test]
    fn test_operation_id_round_trips_through_display() {
        let id = OperationId::new();
        let parsed: OperationId = id.to_string().parse().expect("valid id");
        assert_eq!(parsed, id);
        assert!("not-an-id".parse::<OperationId>().is_err());
    }

    #[test]
    fn test_operation_ids_are_unique() {
        let a = OperationId::new();
        let b = OperationId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_preparing_record_resets_progress() {
        let id = OperationId::new();
        let record = OperationRecord::preparing(id, Mode::Copy);
        assert_eq!(record.id, Some(id));
        assert_eq!(record.status, OperationStatus::Preparing);
        assert_eq!(record.percentage, 0);
        assert_eq!(record.eta, ETA_UNKNOWN);
        assert_eq!(record.transferred_gb, 0.0);
    }

    #[test]
    fn test_byte_estimates_derive_from_gb() {
        let mut record = OperationRecord::idle();
        record.total_gb = 2.0;
        record.transferred_gb = 0.5;
        assert_eq!(record.total_bytes_estimate(), 2 * 1024 * 1024 * 1024);
        assert_eq!(record.transferred_bytes_estimate(), 512 * 1024 * 1024);
    }

    #[test]
    fn test_validate_requires_date_for_copy() {
        let mut request = StartRequest::sync("/src", "/dst");
        assert!(request.validate().is_ok());

        request.mode = Mode::Copy;
        let err = request.validate().unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }

    #[test]
    fn test_validate_rejects_empty_paths() {
        let request = StartRequest::sync("", "/dst");
        assert!(request.validate().is_err());
        let request = StartRequest::sync("/src", "");
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_record_serializes_lowercase_status() {
        let record = OperationRecord::preparing(OperationId::new(), Mode::Sync);
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["status"], "preparing");
        assert_eq!(json["mode"], "sync");
    }
}
