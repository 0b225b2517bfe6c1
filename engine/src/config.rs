//! Engine configuration.
//!
//! External tools are described by `ToolCommand` so callers can point the
//! engine at a specific binary (or a wrapper) without touching the code paths
//! that build the per-operation arguments.

use std::ffi::OsStr;
use std::time::Duration;

use tokio::process::Command;

/// Default wait between SIGTERM and SIGKILL when cancelling.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Label used for copy folders when the sanitized label is empty.
pub const DEFAULT_LABEL: &str = "SD_COPY";

/// A program plus the leading arguments placed before the per-call ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        ToolCommand {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Build a tokio command with the leading arguments followed by `extra`.
    pub fn command<I, S>(&self, extra: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).args(extra);
        cmd
    }
}

/// Settings shared by every operation started through one controller.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Transfer tool, `rsync` by default
    pub transfer_tool: ToolCommand,
    /// Disk-usage tool, `du` by default
    pub size_tool: ToolCommand,
    pub grace_period: Duration,
    pub default_label: String,
    /// Maximum characters kept from one stderr fragment
    pub warning_excerpt_len: usize,
    /// Maximum distinct warnings appended to the record message
    pub max_warnings: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            transfer_tool: ToolCommand::new("rsync"),
            size_tool: ToolCommand::new("du"),
            grace_period: DEFAULT_GRACE_PERIOD,
            default_label: DEFAULT_LABEL.to_string(),
            warning_excerpt_len: 100,
            max_warnings: 8,
        }
    }
}

impl EngineConfig {
    pub fn with_transfer_tool(mut self, tool: ToolCommand) -> Self {
        self.transfer_tool = tool;
        self
    }

    pub fn with_size_tool(mut self, tool: ToolCommand) -> Self {
        self.size_tool = tool;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_default_label(mut self, label: impl Into<String>) -> Self {
        self.default_label = label.into();
        self
    }
}
