//! Progress parsing for the transfer tool's streamed output.
//!
//! With `--info=progress2` the tool rewrites a single terminal line, so updates
//! are separated by `\r` rather than `\n`:
//!
//! ```text
//!       1.23G  42%    5.67MB/s    0:01:23 (xfr#12, to-chk=88/120)
//! ```

use once_cell::sync::Lazy;
use regex::Regex;

use crate::size::parse_size_to_gb;

static PROGRESS_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(\d[\d.,]*[KMGT]?B?)\s+(\d+)%\s+([\d.,]+[KMGT]?B?/s)\s+(\d{1,2}:\d{2}:\d{2})\s+\(xfr#(\d+)",
    )
    .expect("valid progress regex")
});

/// Structured fields recovered from one progress line.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// 0..=100
    pub percentage: u8,
    /// Time column as printed by the tool (`H:MM:SS`)
    pub eta: String,
    /// Raw transferred-size column, e.g. `1.23G`
    pub transferred_token: String,
    pub files_transferred: u64,
}

impl ProgressUpdate {
    /// Transferred size in GB.
    pub fn transferred_gb(&self) -> f64 {
        parse_size_to_gb(&self.transferred_token)
    }
}

/// Parse one trimmed status line. Lines without the full progress pattern,
/// or with an out-of-range percentage, yield `None`.
pub fn parse_progress_line(line: &str) -> Option<ProgressUpdate> {
    let caps = PROGRESS_LINE.captures(line)?;
    let percentage: u8 = caps[2].parse().ok().filter(|p| *p <= 100)?;
    let files_transferred = caps[5].parse().ok()?;
    Some(ProgressUpdate {
        percentage,
        eta: caps[4].to_string(),
        transferred_token: caps[1].to_string(),
        files_transferred,
    })
}

/// Reassembles `\r`-terminated status lines from arbitrary output chunks.
///
/// Works on raw bytes so a chunk boundary may fall anywhere, including inside
/// a multi-byte character; a cut segment is held until its terminator arrives.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning the complete non-empty lines it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let Some(last_cr) = self.pending.iter().rposition(|b| *b == b'\r') else {
            return Vec::new();
        };
        let rest = self.pending.split_off(last_cr + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        split_status_lines(&String::from_utf8_lossy(&complete))
    }

    /// Flush whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Vec<String> {
        let rest = std::mem::take(&mut self.pending);
        split_status_lines(&String::from_utf8_lossy(&rest))
    }
}

/// Split a block of output on `\r`, trimming and discarding empty pieces.
pub fn split_status_lines(block: &str) -> Vec<String> {
    block
        .split('\r')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
