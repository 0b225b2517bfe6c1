//! Human-readable size tokens and the source size estimator.
//!
//! Sizes are carried in gigabytes as `f64`: `T` = 1024 GB, `G` = 1 GB,
//! `M` = 1/1024 GB, `K` = 1/1024² GB, and a bare number is a byte count.

use std::path::Path;
use std::process::Stdio;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::ToolCommand;
use crate::fs_ops;

static SIZE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+\.?\d*)\s*([TGMK]?)B?").expect("valid size regex"));

/// Convert a token such as `6.00M`, `1,23G`, `1T` or `512` to gigabytes.
///
/// Returns 0.0 when the token holds no number.
pub fn parse_size_to_gb(token: &str) -> f64 {
    let normalized = token.replace(',', ".");
    let Some(caps) = SIZE_TOKEN.captures(&normalized) else {
        return 0.0;
    };
    let Ok(value) = caps[1].parse::<f64>() else {
        return 0.0;
    };
    match caps[2].to_ascii_uppercase().as_str() {
        "T" => value * 1024.0,
        "G" => value,
        "M" => value / 1024.0,
        "K" => value / (1024.0 * 1024.0),
        _ => value / (1024.0 * 1024.0 * 1024.0),
    }
}

/// Run the disk-usage tool on `source` and return its size in GB.
///
/// Best effort: any failure is logged and reported as 0.0. Dropping the
/// future kills the tool.
pub async fn estimate_source_size(tool: &ToolCommand, source: &Path) -> f64 {
    let target = fs_ops::with_trailing_separator(source);
    let output = tool
        .command([std::ffi::OsStr::new("-sh"), target.as_os_str()])
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await;

    let output = match output {
        Ok(output) => output,
        Err(e) => {
            warn!(program = %tool.program, error = %e, "size estimator could not be started");
            return 0.0;
        }
    };

    if !output.stderr.is_empty() {
        debug!(
            program = %tool.program,
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "size estimator wrote to stderr"
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    match stdout.split_whitespace().next() {
        Some(token) => {
            let gb = parse_size_to_gb(token);
            debug!(source = %source.display(), token, gb, "estimated source size");
            gb
        }
        None => {
            warn!(
                source = %source.display(),
                status = ?output.status.code(),
                "could not parse size estimator output"
            );
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_parse_units() {
        assert!(approx(parse_size_to_gb("6.00M"), 6.0 / 1024.0));
        assert!(approx(parse_size_to_gb("1T"), 1024.0));
        assert!(approx(parse_size_to_gb("1.23G"), 1.23));
        assert!(approx(parse_size_to_gb("2K"), 2.0 / (1024.0 * 1024.0)));
        assert!(approx(parse_size_to_gb("512"), 512.0 / (1024.0 * 1024.0 * 1024.0)));
    }

    #[test]
    fn test_parse_accepts_comma_and_trailing_b() {
        assert!(approx(parse_size_to_gb("1,5GB"), 1.5));
        assert!(approx(parse_size_to_gb("3mb"), 3.0 / 1024.0));
        assert!(approx(parse_size_to_gb("14.8 G"), 14.8));
    }

    #[test]
    fn test_parse_garbage_is_zero() {
        assert_eq!(parse_size_to_gb(""), 0.0);
        assert_eq!(parse_size_to_gb("unknown"), 0.0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_estimate_reads_first_token() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let tool = ToolCommand::new("sh").with_args(["-c", "echo '6.00M\t/some/path/'", "du"]);
        let gb = estimate_source_size(&tool, dir.path()).await;
        assert!(approx(gb, 6.0 / 1024.0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_estimate_failure_is_zero() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let missing = ToolCommand::new("/nonexistent/du-binary");
        assert_eq!(estimate_source_size(&missing, dir.path()).await, 0.0);

        let silent = ToolCommand::new("sh").with_args(["-c", "exit 1", "du"]);
        assert_eq!(estimate_source_size(&silent, dir.path()).await, 0.0);
    }
}
