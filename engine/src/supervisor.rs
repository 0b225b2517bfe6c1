//! Transfer process supervision.
//!
//! The supervisor owns the child process of one operation. Two reader tasks
//! reduce its stdout (progress) and stderr (warnings) into the shared record,
//! while the supervising task waits for either the exit or a cancellation
//! request. Termination is SIGTERM first, SIGKILL after the grace period.

use std::collections::HashSet;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ToolCommand;
use crate::controller::{lock_slot, SharedSlot};
use crate::error::EngineError;
use crate::fs_ops::with_trailing_separator;
use crate::model::{Mode, OperationId, OperationRecord, OperationStatus};
use crate::progress::{parse_progress_line, LineSplitter, ProgressUpdate};
use crate::size;

/// Exit code meaning "partial transfer because source files vanished".
pub const EXIT_PARTIAL_VANISHED: i32 = 24;

const READ_CHUNK: usize = 8 * 1024;
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) const STAGE_SIZING: &str = "Calculating source size...";
pub(crate) const STAGE_PROCESSING: &str = "Processing files...";

/// Arguments for one transfer: archive mode, human-readable aggregate
/// progress, and `--ignore-existing` for one-way sync.
pub fn transfer_args(source: &Path, destination: &Path, mode: Mode) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-ah".into(),
        "--info=progress2,misc0,flist0,stats0".into(),
    ];
    if mode == Mode::Sync {
        args.push("--ignore-existing".into());
    }
    args.push(with_trailing_separator(source));
    args.push(destination.as_os_str().to_os_string());
    args
}

/// Start the transfer tool with piped output.
pub fn spawn_transfer(
    tool: &ToolCommand,
    source: &Path,
    destination: &Path,
    mode: Mode,
) -> Result<Child, EngineError> {
    let args = transfer_args(source, destination, mode);
    debug!(program = %tool.program, ?args, "launching transfer tool");
    tool.command(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| EngineError::LaunchFailed {
            program: tool.program.clone(),
            source: e,
        })
}

/// How an operation ended, decided from the exit status and the cancel flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed { partial: bool },
    Failed { code: Option<i32> },
    Cancelled,
}

/// Classify an exit. A requested cancellation wins over any exit code.
pub fn classify_exit(code: Option<i32>, cancel_requested: bool) -> Outcome {
    if cancel_requested {
        return Outcome::Cancelled;
    }
    match code {
        Some(0) => Outcome::Completed { partial: false },
        Some(EXIT_PARTIAL_VANISHED) => Outcome::Completed { partial: true },
        code => Outcome::Failed { code },
    }
}

/// Deduplicates stderr warnings by class and bounds how many are kept.
///
/// The class of a warning is its text before the first quoted path, so
/// repeated "failed to open" errors for different files count once.
#[derive(Debug)]
pub struct WarningLog {
    seen: HashSet<String>,
    excerpt_len: usize,
    max_warnings: usize,
}

impl WarningLog {
    pub fn new(excerpt_len: usize, max_warnings: usize) -> Self {
        WarningLog {
            seen: HashSet::new(),
            excerpt_len,
            max_warnings,
        }
    }

    /// Returns the excerpt to append if this warning belongs to a new class.
    pub fn admit(&mut self, fragment: &str) -> Option<String> {
        let fragment = fragment.trim();
        if fragment.is_empty() || self.seen.len() >= self.max_warnings {
            return None;
        }
        let class = warning_class(fragment);
        if !self.seen.insert(class) {
            return None;
        }
        Some(fragment.chars().take(self.excerpt_len).collect())
    }

    pub(crate) fn len(&self) -> usize {
        self.seen.len()
    }
}

fn warning_class(fragment: &str) -> String {
    let head = fragment.split('"').next().unwrap_or(fragment);
    head.trim().to_string()
}

/// Everything the supervising task needs for one operation.
pub(crate) struct Supervision {
    pub id: OperationId,
    pub slot: SharedSlot,
    pub cancel: CancellationToken,
    pub program: String,
    pub size_tool: ToolCommand,
    pub source: PathBuf,
    pub grace_period: Duration,
    pub warning_excerpt_len: usize,
    pub max_warnings: usize,
}

/// Drive one child process to completion and write the terminal state.
///
/// The source size is estimated alongside the transfer; the estimate gets
/// the drain timeout after the exit to land before it is abandoned.
pub(crate) async fn supervise(mut child: Child, ctx: Supervision) {
    let estimate_task = Some(tokio::spawn(record_source_size(
        ctx.size_tool.clone(),
        ctx.source.clone(),
        ctx.id,
        ctx.slot.clone(),
    )));
    let stdout_task = child
        .stdout
        .take()
        .map(|out| tokio::spawn(read_progress(out, ctx.id, ctx.slot.clone())));
    let stderr_task = child.stderr.take().map(|err| {
        let log = WarningLog::new(ctx.warning_excerpt_len, ctx.max_warnings);
        tokio::spawn(read_warnings(err, ctx.id, ctx.slot.clone(), ctx.program.clone(), log))
    });

    let status = tokio::select! {
        status = child.wait() => status,
        _ = ctx.cancel.cancelled() => terminate(&mut child, ctx.grace_period).await,
    };
    let cancel_requested = close_cancellation(&ctx);

    drain(stdout_task).await;
    drain(stderr_task).await;
    drain(estimate_task).await;

    finish(&ctx, status, cancel_requested);
}

/// Stop accepting cancel requests once the child is gone and report whether
/// one arrived before that.
fn close_cancellation(ctx: &Supervision) -> bool {
    let mut slot = lock_slot(&ctx.slot);
    if slot.record.id != Some(ctx.id) {
        return false;
    }
    slot.cancel = None;
    slot.cancel_requested
}

async fn record_source_size(tool: ToolCommand, source: PathBuf, id: OperationId, slot: SharedSlot) {
    let total_gb = size::estimate_source_size(&tool, &source).await;
    info!(operation = %id, total_gb, "source size estimated");

    let mut slot = lock_slot(&slot);
    let record = &mut slot.record;
    if record.id != Some(id) {
        return;
    }
    record.total_gb = total_gb;
    if record.status == OperationStatus::Running && record.current_stage == STAGE_SIZING {
        record.current_stage = STAGE_PROCESSING.to_string();
    }
}

/// Ask the child to stop, escalating to a kill once the grace period passes.
async fn terminate(child: &mut Child, grace_period: Duration) -> io::Result<ExitStatus> {
    request_graceful_stop(child);
    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(
                grace_ms = grace_period.as_millis() as u64,
                "transfer did not stop after SIGTERM, sending SIGKILL"
            );
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill transfer process");
            }
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn request_graceful_stop(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        warn!(pid, error = %e, "SIGTERM failed, killing transfer process");
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn request_graceful_stop(child: &mut Child) {
    let _ = child.start_kill();
}

/// Wait for a reader to reach EOF; abort it if a stray grandchild keeps the pipe open.
async fn drain(task: Option<JoinHandle<()>>) {
    let Some(mut task) = task else {
        return;
    };
    if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut task).await.is_err() {
        debug!("output reader still open after exit, aborting it");
        task.abort();
    }
}

async fn read_progress<R>(mut stdout: R, id: OperationId, slot: SharedSlot)
where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let lines = match stdout.read(&mut buf).await {
            Ok(0) => {
                apply_lines(&slot, id, splitter.finish());
                break;
            }
            Ok(n) => splitter.push(&buf[..n]),
            Err(e) => {
                debug!(error = %e, "stdout read failed");
                break;
            }
        };
        apply_lines(&slot, id, lines);
    }
}

fn apply_lines(slot: &SharedSlot, id: OperationId, lines: Vec<String>) {
    if lines.is_empty() {
        return;
    }
    let mut slot = lock_slot(slot);
    for line in lines {
        match parse_progress_line(&line) {
            Some(update) => apply_update(&mut slot.record, id, &update),
            None => trace!(%line, "non-progress output"),
        }
    }
}

/// Merge one parsed update into the record, keeping the counters monotonic.
pub fn apply_update(record: &mut OperationRecord, id: OperationId, update: &ProgressUpdate) {
    if record.id != Some(id) || !record.status.is_active() {
        return;
    }
    record.percentage = record.percentage.max(update.percentage);
    record.eta = update.eta.clone();
    record.transferred_gb = record.transferred_gb.max(update.transferred_gb());
    record.files_transferred = record.files_transferred.max(update.files_transferred);
    if record.status == OperationStatus::Running {
        record.current_stage = STAGE_PROCESSING.to_string();
    }
}

async fn read_warnings<R>(stderr: R, id: OperationId, slot: SharedSlot, program: String, mut log: WarningLog)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                warn!(program = %program, "{}", text);
                if let Some(excerpt) = log.admit(text) {
                    let mut slot = lock_slot(&slot);
                    if slot.record.id == Some(id) {
                        slot.record
                            .message
                            .push_str(&format!(" ({} warning: {})", program, excerpt));
                        slot.warnings = log.len();
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, "stderr read failed");
                break;
            }
        }
    }
}

fn finish(ctx: &Supervision, status: io::Result<ExitStatus>, cancel_requested: bool) {
    let mut slot = lock_slot(&ctx.slot);
    if slot.record.id != Some(ctx.id) {
        return;
    }

    let noun = slot
        .record
        .mode
        .map(|m| m.to_string())
        .unwrap_or_else(|| "Operation".to_string());
    let warnings = slot.warnings;
    let record = &mut slot.record;

    let outcome = match &status {
        Ok(status) => classify_exit(status.code(), cancel_requested),
        Err(_) if cancel_requested => Outcome::Cancelled,
        Err(_) => Outcome::Failed { code: None },
    };

    match outcome {
        Outcome::Cancelled => {
            record.status = OperationStatus::Cancelled;
            record.current_stage = "Cancelled".to_string();
            record.message = format!("{} cancelled.", noun);
        }
        Outcome::Completed { partial } => {
            record.status = OperationStatus::Completed;
            record.current_stage = "Completed".to_string();
            record.percentage = 100;
            if record.total_gb > 0.0 {
                record.transferred_gb = record.total_gb;
            }
            record.message = format!("{} completed.", noun);
            if partial {
                record
                    .message
                    .push_str(" Some source files vanished during the transfer.");
            } else if warnings > 0 {
                record.message.push_str(" (with warnings, check the logs)");
            }
        }
        Outcome::Failed { code } => {
            record.status = OperationStatus::Error;
            record.current_stage = "Error".to_string();
            record.message = match &status {
                Ok(_) => {
                    let failure = EngineError::RuntimeFailure {
                        program: ctx.program.clone(),
                        code,
                    };
                    format!("{} failed: {}.", noun, failure)
                }
                Err(e) => format!("{} failed: could not wait for {}: {}", noun, ctx.program, e),
            };
        }
    }

    record.id = None;
    slot.cancel = None;
    slot.cancel_requested = false;
    info!(
        operation = %ctx.id,
        status = %slot.record.status,
        message = %slot.record.message,
        "operation finished"
    );
}
