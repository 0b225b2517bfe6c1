//! Filesystem operations module.
//!
//! This module provides the destination planning for operations:
//! - Sanitizing the user label into a folder-safe name
//! - Allocating a collision-free `<YYYYMMDD>/<LABEL>_<NNNNN>` folder for copies
//! - Creating directories idempotently
//! - Path helpers shared with the supervisor and size estimator

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};

use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::error::EngineError;
use crate::model::Mode;

/// Highest counter tried when allocating a copy folder.
pub const MAX_FOLDER_COUNTER: u32 = 99_999;

static DISALLOWED_LABEL_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\w\s-]").expect("valid label regex"));
static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid space regex"));

/// Turn a free-text label into a folder name component.
///
/// Drops everything but word characters, whitespace and hyphens, turns each
/// whitespace run into one hyphen and upper-cases the result. An empty result
/// falls back to `default_label`.
pub fn sanitize_label(label: Option<&str>, default_label: &str) -> String {
    let raw = label.unwrap_or("");
    let stripped = DISALLOWED_LABEL_CHARS.replace_all(raw, "");
    let hyphenated = WHITESPACE_RUN.replace_all(&stripped, "-");
    let upper = hyphenated.to_uppercase();
    if upper.is_empty() {
        default_label.to_string()
    } else {
        upper
    }
}

/// `YYYYMMDD` for the given calendar date.
pub fn date_stamp(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Parse a copy date given either as `YYYY-MM-DD` or as an RFC 3339 timestamp.
///
/// Timestamps are normalized to UTC before taking the calendar date.
pub fn parse_copy_date(input: &str) -> Result<NaiveDate, EngineError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(EngineError::validation("copy date is required for copy mode"));
    }
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        return Ok(date);
    }
    DateTime::parse_from_rfc3339(input)
        .map(|dt| dt.with_timezone(&Utc).date_naive())
        .map_err(|_| EngineError::validation(format!("invalid copy date '{}'", input)))
}

/// Resolve the final destination of an operation, creating directories as needed.
///
/// `Mode::Sync` returns `root` unchanged. `Mode::Copy` ensures
/// `root/<YYYYMMDD>` exists and allocates the first free `<LABEL>_<NNNNN>`
/// beneath it.
pub fn plan_destination(
    root: &Path,
    mode: Mode,
    date: Option<NaiveDate>,
    label: Option<&str>,
    default_label: &str,
) -> Result<PathBuf, EngineError> {
    match mode {
        Mode::Sync => Ok(root.to_path_buf()),
        Mode::Copy => {
            let date = date.ok_or_else(|| {
                EngineError::validation("copy date is required for copy mode")
            })?;
            let label = sanitize_label(label, default_label);
            let date_dir = root.join(date_stamp(date));
            ensure_dir(&date_dir)?;

            let folder = allocate_folder(&date_dir, &label, MAX_FOLDER_COUNTER)?;
            ensure_dir(&folder)?;
            debug!(destination = %folder.display(), "allocated copy folder");
            Ok(folder)
        }
    }
}

/// First `<label>_<NNNNN>` under `date_dir` that does not exist yet.
fn allocate_folder(date_dir: &Path, label: &str, max_counter: u32) -> Result<PathBuf, EngineError> {
    (1..=max_counter)
        .map(|counter| date_dir.join(format!("{}_{:05}", label, counter)))
        .find(|candidate| !candidate.exists())
        .ok_or_else(|| EngineError::PlanningExhausted {
            date_dir: date_dir.to_path_buf(),
            label: label.to_string(),
        })
}

/// Create `path` and its parents if missing; succeed if it already is a directory.
pub fn ensure_dir(path: &Path) -> Result<(), EngineError> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::DirectoryCreationFailed {
            path: path.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::AlreadyExists,
                "Path exists but is not a directory",
            ),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(path).map_err(|e| EngineError::DirectoryCreationFailed {
                path: path.to_path_buf(),
                source: e,
            })
        }
        Err(e) => Err(EngineError::DirectoryCreationFailed {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Fail with `PathNotFound` unless `path` exists.
pub fn require_existing(path: &Path) -> Result<(), EngineError> {
    if path.exists() {
        Ok(())
    } else {
        Err(EngineError::PathNotFound {
            path: path.to_path_buf(),
        })
    }
}

/// `path` with exactly one trailing separator, so the transfer tool copies
/// the directory's contents rather than the directory itself.
pub fn with_trailing_separator(path: &Path) -> OsString {
    let mut os = path.as_os_str().to_os_string();
    if !os.to_string_lossy().ends_with(MAIN_SEPARATOR) {
        os.push(MAIN_SEPARATOR.to_string());
    }
    os
}
