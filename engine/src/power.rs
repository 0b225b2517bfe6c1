//! Host power control.

use std::fmt;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ToolCommand;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    Reboot,
    Shutdown,
}

impl PowerAction {
    /// Arguments passed to the privilege wrapper.
    pub fn args(self) -> &'static [&'static str] {
        match self {
            PowerAction::Reboot => &["reboot"],
            PowerAction::Shutdown => &["shutdown", "-h", "now"],
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerAction::Reboot => write!(f, "reboot"),
            PowerAction::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Runs power actions through `sudo` (or another wrapper).
#[derive(Debug, Clone)]
pub struct PowerControl {
    wrapper: ToolCommand,
}

impl Default for PowerControl {
    fn default() -> Self {
        PowerControl::new(ToolCommand::new("sudo"))
    }
}

impl PowerControl {
    pub fn new(wrapper: ToolCommand) -> Self {
        PowerControl { wrapper }
    }

    /// Full command line, for logs and error messages.
    pub fn command_line(&self, action: PowerAction) -> String {
        std::iter::once(self.wrapper.program.as_str())
            .chain(self.wrapper.args.iter().map(String::as_str))
            .chain(action.args().iter().copied())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run `action` and wait for the command to return.
    pub async fn execute(&self, action: PowerAction) -> Result<(), EngineError> {
        let command = self.command_line(action);
        info!(%action, %command, "executing power action");

        let output = self
            .wrapper
            .command(action.args())
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| EngineError::LaunchFailed {
                program: self.wrapper.program.clone(),
                source: e,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            warn!(
                %command,
                code = ?output.status.code(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "power action failed"
            );
            Err(EngineError::CommandFailed {
                command,
                code: output.status.code(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_lines() {
        let control = PowerControl::default();
        assert_eq!(control.command_line(PowerAction::Reboot), "sudo reboot");
        assert_eq!(control.command_line(PowerAction::Shutdown), "sudo shutdown -h now");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_reports_exit_status() {
        // the action words arrive as $1.. of the script
        let ok = PowerControl::new(ToolCommand::new("sh").with_args(["-c", "test \"$1\" = reboot", "sudo"]));
        ok.execute(PowerAction::Reboot).await.expect("reboot should succeed");

        let err = ok.execute(PowerAction::Shutdown).await.unwrap_err();
        assert!(matches!(err, EngineError::CommandFailed { code: Some(1), .. }));
    }

    #[tokio::test]
    async fn test_execute_launch_failure() {
        let control = PowerControl::new(ToolCommand::new("/nonexistent/sudo"));
        let err = control.execute(PowerAction::Reboot).await.unwrap_err();
        assert!(matches!(err, EngineError::LaunchFailed { .. }));
    }
}
