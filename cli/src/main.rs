//! CardCopy - Command-line interface for the transfer engine.
//!
//! Lists removable devices, runs copy and sync operations with a live
//! progress bar, and triggers host power actions.

use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use clap::{Parser, Subcommand};
use engine::config::DEFAULT_LABEL;
use engine::{
    parse_copy_date, DeviceLister, EngineConfig, EngineError, ErrorKind, LsblkDeviceLister,
    OperationController, OperationRecord, OperationStatus, PowerAction, PowerControl,
    StartRequest, ToolCommand,
};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// CardCopy - Back up memory cards with rsync
#[derive(Parser, Debug)]
#[command(name = "cardcopy")]
#[command(version = "0.1.0")]
#[command(about = "Copy and sync memory cards with progress tracking")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Transfer tool to run
    #[arg(long, global = true, env = "CARDCOPY_RSYNC", default_value = "rsync")]
    rsync: String,

    /// Disk-usage tool used for the size estimate
    #[arg(long, global = true, env = "CARDCOPY_DU", default_value = "du")]
    du: String,

    /// Folder label for copies made without --label
    #[arg(long, global = true, env = "CARDCOPY_DEFAULT_LABEL", default_value = DEFAULT_LABEL)]
    default_label: String,

    /// Milliseconds to wait after SIGTERM before killing a cancelled transfer
    #[arg(long, global = true, value_name = "MS", default_value_t = 2000)]
    grace_ms: u64,

    /// Enable debug logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List mounted removable devices
    Devices,
    /// Copy a card into <dst>/<YYYYMMDD>/<LABEL>_<NNNNN>
    Copy {
        #[arg(long, value_name = "PATH")]
        src: PathBuf,
        #[arg(long, value_name = "PATH")]
        dst: PathBuf,
        /// Copy date (YYYY-MM-DD or RFC 3339), today in UTC if omitted
        #[arg(long)]
        date: Option<String>,
        /// Folder label, e.g. the camera make
        #[arg(long)]
        label: Option<String>,
    },
    /// Sync a card into <dst>, skipping files that already exist
    Sync {
        #[arg(long, value_name = "PATH")]
        src: PathBuf,
        #[arg(long, value_name = "PATH")]
        dst: PathBuf,
    },
    /// Reboot the host
    Reboot,
    /// Shut down the host
    Shutdown,
}

/// How a command failed, which decides the exit code.
#[derive(Debug)]
enum Failure {
    /// Bad arguments or a rejected request
    Usage(String),
    /// The operation ran and did not complete
    Operation(String),
}

impl Failure {
    fn exit_code(&self) -> i32 {
        match self {
            Failure::Usage(_) => 2,
            Failure::Operation(_) => 1,
        }
    }

    fn message(&self) -> &str {
        match self {
            Failure::Usage(msg) | Failure::Operation(msg) => msg,
        }
    }
}

impl From<EngineError> for Failure {
    fn from(e: EngineError) -> Self {
        match e.kind() {
            ErrorKind::Validation | ErrorKind::Conflict | ErrorKind::NotFound => {
                Failure::Usage(e.to_string())
            }
            _ => Failure::Operation(e.to_string()),
        }
    }
}

/// Progress rendering for a polled operation
struct CliProgress {
    json: bool,
    start_time: Instant,
}

impl CliProgress {
    fn new(json: bool) -> Self {
        CliProgress {
            json,
            start_time: Instant::now(),
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    fn progress_bar(percent: u8) -> String {
        let filled = (percent.min(100) / 5) as usize;
        let empty = 20 - filled;
        format!("[{}{}] {:>3}%", "=".repeat(filled), " ".repeat(empty), percent)
    }

    fn render(&self, record: &OperationRecord) {
        if self.json {
            return;
        }
        let total = if record.total_gb > 0.0 {
            Self::format_bytes(record.total_bytes_estimate())
        } else {
            "?".to_string()
        };
        eprint!(
            "\r{} {}/{} | {} files | ETA {} | {:<28}",
            Self::progress_bar(record.percentage),
            Self::format_bytes(record.transferred_bytes_estimate()),
            total,
            record.files_transferred,
            record.eta,
            record.current_stage
        );
        let _ = std::io::stderr().flush();
    }

    fn finish(&self, record: &OperationRecord) {
        if self.json {
            match serde_json::to_string_pretty(record) {
                Ok(json) => println!("{}", json),
                Err(e) => warn!(error = %e, "failed to serialize record"),
            }
            return;
        }
        eprintln!();
        println!("{}", record.message);
        if let Some(destination) = &record.destination {
            println!("Destination: {}", destination.display());
        }
        println!(
            "Transferred: {} in {} files",
            Self::format_bytes(record.transferred_bytes_estimate()),
            record.files_transferred
        );
        println!("Elapsed: {}", Self::format_duration(self.start_time.elapsed()));
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let exit_code = match run_cli(&cli).await {
        Ok(()) => 0,
        Err(failure) => {
            eprintln!("Error: {}", failure.message());
            failure.exit_code()
        }
    };

    std::process::exit(exit_code);
}

/// Main CLI logic - separated for testability
async fn run_cli(cli: &Cli) -> Result<(), Failure> {
    match &cli.command {
        Command::Devices => {
            let devices = LsblkDeviceLister::default().list_devices().await;
            print_devices(&devices, cli.json);
            Ok(())
        }
        Command::Copy {
            src,
            dst,
            date,
            label,
        } => {
            let date = match date {
                Some(raw) => parse_copy_date(raw)?,
                None => Utc::now().date_naive(),
            };
            let request = StartRequest::copy(src, dst, date, label.clone());
            run_operation(&controller(cli), request, cli.json).await
        }
        Command::Sync { src, dst } => {
            run_operation(&controller(cli), StartRequest::sync(src, dst), cli.json).await
        }
        Command::Reboot => power(PowerAction::Reboot).await,
        Command::Shutdown => power(PowerAction::Shutdown).await,
    }
}

fn controller(cli: &Cli) -> OperationController {
    let config = EngineConfig::default()
        .with_transfer_tool(ToolCommand::new(&cli.rsync))
        .with_size_tool(ToolCommand::new(&cli.du))
        .with_grace_period(Duration::from_millis(cli.grace_ms))
        .with_default_label(&cli.default_label);
    OperationController::new(config)
}

/// What a Ctrl-C press should do to the running operation.
#[derive(Debug, PartialEq, Eq)]
enum Interrupt {
    Cancel,
    Abandon,
}

/// Counts Ctrl-C presses: the first cancels, the next one stops waiting.
#[derive(Debug, Default)]
struct Interrupts {
    count: u32,
}

impl Interrupts {
    fn press(&mut self) -> Interrupt {
        self.count += 1;
        if self.count == 1 {
            Interrupt::Cancel
        } else {
            Interrupt::Abandon
        }
    }
}

/// Start an operation and poll it until it ends, cancelling on Ctrl-C.
/// A second Ctrl-C returns without waiting for the transfer to stop.
async fn run_operation(
    controller: &OperationController,
    request: StartRequest,
    json: bool,
) -> Result<(), Failure> {
    let progress = CliProgress::new(json);
    let id = controller.start(request).await?;
    debug!(operation = %id, "polling operation");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut listening = true;
    let mut interrupts = Interrupts::default();
    let mut ticker = tokio::time::interval(POLL_INTERVAL);

    let record = loop {
        tokio::select! {
            _ = ticker.tick() => {
                let record = controller.progress(id)?;
                progress.render(&record);
                if record.status.is_terminal() {
                    break record;
                }
            }
            signal = &mut ctrl_c, if listening => {
                if let Err(e) = signal {
                    warn!(error = %e, "failed to listen for Ctrl-C");
                    listening = false;
                    continue;
                }
                ctrl_c.set(tokio::signal::ctrl_c());
                match interrupts.press() {
                    Interrupt::Cancel => {
                        eprintln!();
                        eprintln!("Cancelling... (press Ctrl-C again to stop waiting)");
                        if let Err(e) = controller.cancel(id) {
                            warn!(error = %e, "cancel request was not accepted");
                        }
                    }
                    Interrupt::Abandon => {
                        return Err(Failure::Operation(
                            "Interrupted again; not waiting for the transfer to stop".to_string(),
                        ));
                    }
                }
            }
        }
    };

    progress.finish(&record);
    match record.status {
        OperationStatus::Completed => Ok(()),
        _ => Err(Failure::Operation(record.message)),
    }
}

fn print_devices(devices: &[engine::Device], json: bool) {
    if json {
        match serde_json::to_string_pretty(devices) {
            Ok(out) => println!("{}", out),
            Err(e) => warn!(error = %e, "failed to serialize devices"),
        }
        return;
    }
    if devices.is_empty() {
        println!("No removable devices found.");
        return;
    }
    for device in devices {
        println!(
            "{:<32} {:<16} {:>9.1} GB {:>9.1} GB free  {} {}",
            device.mount_path, device.label, device.total_gb, device.free_gb, device.vendor, device.model
        );
    }
}

async fn power(action: PowerAction) -> Result<(), Failure> {
    PowerControl::default().execute(action).await?;
    println!("{} requested", action);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cli(command: Command, rsync: &str) -> Cli {
        Cli {
            command,
            rsync: rsync.to_string(),
            du: "true".to_string(),
            default_label: DEFAULT_LABEL.to_string(),
            grace_ms: 200,
            verbose: false,
            json: true,
        }
    }

    #[test]
    fn test_progress_bar() {
        assert_eq!(CliProgress::progress_bar(0), "[                    ]   0%");
        assert_eq!(CliProgress::progress_bar(50), "[==========          ]  50%");
        assert_eq!(CliProgress::progress_bar(100), "[====================] 100%");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(CliProgress::format_bytes(512), "512.00 B");
        assert_eq!(CliProgress::format_bytes(1536), "1.50 KB");
        assert_eq!(CliProgress::format_bytes(2 * 1024 * 1024 * 1024), "2.00 GB");
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "cardcopy", "copy", "--src", "/media/card", "--dst", "/mnt/backup", "--date", "2024-03-05",
            "--grace-ms", "500", "--json",
        ])
        .expect("Failed to parse args");
        assert_eq!(cli.grace_ms, 500);
        assert!(cli.json);
        assert!(matches!(cli.command, Command::Copy { ref date, .. } if date.as_deref() == Some("2024-03-05")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_sync_with_succeeding_tool() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");

        let args = cli(
            Command::Sync {
                src: src_dir.path().to_path_buf(),
                dst: dst_dir.path().to_path_buf(),
            },
            "true",
        );

        let result = run_cli(&args).await;
        assert!(result.is_ok(), "CLI should succeed when the tool exits 0");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_copy_creates_dated_folder() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");

        let args = cli(
            Command::Copy {
                src: src_dir.path().to_path_buf(),
                dst: dst_dir.path().to_path_buf(),
                date: Some("2024-03-05".to_string()),
                label: Some("canon".to_string()),
            },
            "true",
        );

        run_cli(&args).await.expect("CLI copy should succeed");
        assert!(dst_dir.path().join("20240305").join("CANON_00001").is_dir());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_copy_uses_default_label_flag() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");

        let mut args = cli(
            Command::Copy {
                src: src_dir.path().to_path_buf(),
                dst: dst_dir.path().to_path_buf(),
                date: Some("2024-03-05".to_string()),
                label: None,
            },
            "true",
        );
        args.default_label = "CARD".to_string();

        run_cli(&args).await.expect("CLI copy should succeed");
        assert!(dst_dir.path().join("20240305").join("CARD_00001").is_dir());
    }

    #[test]
    fn test_parse_default_label_flag() {
        let cli = Cli::try_parse_from([
            "cardcopy", "copy", "--src", "/media/card", "--dst", "/mnt/backup", "--default-label", "CARD",
        ])
        .expect("Failed to parse args");
        assert_eq!(cli.default_label, "CARD");
    }

    #[test]
    fn test_second_interrupt_abandons_operation() {
        let mut interrupts = Interrupts::default();
        assert_eq!(interrupts.press(), Interrupt::Cancel);
        assert_eq!(interrupts.press(), Interrupt::Abandon);
        assert_eq!(interrupts.press(), Interrupt::Abandon);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_failing_tool_exits_with_one() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");

        let args = cli(
            Command::Sync {
                src: src_dir.path().to_path_buf(),
                dst: dst_dir.path().to_path_buf(),
            },
            "false",
        );

        let failure = run_cli(&args).await.unwrap_err();
        assert_eq!(failure.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_cli_rejects_missing_source() {
        let dst_dir = TempDir::new().expect("Failed to create temp dir");

        let args = cli(
            Command::Sync {
                src: PathBuf::from("/nonexistent/path"),
                dst: dst_dir.path().to_path_buf(),
            },
            "true",
        );

        let failure = run_cli(&args).await.unwrap_err();
        assert_eq!(failure.exit_code(), 2, "CLI should reject missing source");
    }

    #[tokio::test]
    async fn test_cli_rejects_invalid_date() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");

        let args = cli(
            Command::Copy {
                src: src_dir.path().to_path_buf(),
                dst: dst_dir.path().to_path_buf(),
                date: Some("05/03/2024".to_string()),
                label: None,
            },
            "true",
        );

        let failure = run_cli(&args).await.unwrap_err();
        assert_eq!(failure.exit_code(), 2, "CLI should reject invalid date");
        assert_eq!(std::fs::read_dir(dst_dir.path()).expect("read dst").count(), 0);
    }

    #[test]
    fn test_launch_errors_are_operation_failures() {
        let failure = Failure::from(EngineError::LaunchFailed {
            program: "rsync".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        });
        assert_eq!(failure.exit_code(), 1);
    }
}
