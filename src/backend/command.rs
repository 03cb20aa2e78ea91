//! Bounded execution of substrate CLI tools (`tmux`, `docker`).

use std::io::ErrorKind;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::{AppError, Result};

/// Captured result of a finished substrate command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Whether the command exited with status zero.
    pub success: bool,
    /// Trimmed standard output.
    pub stdout: String,
    /// Trimmed standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Stdout on success, otherwise an error built from stderr.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `wrap` when the command failed.
    pub fn into_stdout(self, wrap: impl FnOnce(String) -> AppError) -> Result<String> {
        if self.success {
            Ok(self.stdout)
        } else {
            Err(wrap(self.stderr))
        }
    }
}

/// Run `bin args...` to completion, giving up after `bound`.
///
/// Returns `Ok(None)` when the bound expires; the child is killed then.
///
/// # Errors
///
/// Returns `AppError::BackendUnavailable` if the binary cannot be started.
pub async fn run_bounded(
    bin: &str,
    args: &[String],
    bound: Duration,
) -> Result<Option<CommandOutput>> {
    debug!(bin, ?args, "running substrate command");
    let child = Command::new(bin)
        .args(args)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(bound, child).await {
        Err(_) => return Ok(None),
        Ok(Err(err)) if err.kind() == ErrorKind::NotFound => {
            return Err(AppError::BackendUnavailable(format!("{bin} not found on PATH")));
        }
        Ok(Err(err)) => {
            return Err(AppError::BackendUnavailable(format!(
                "failed to exec {bin}: {err}"
            )));
        }
        Ok(Ok(output)) => output,
    };

    Ok(Some(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
    }))
}

/// Like [`run_bounded`], turning an expired bound into the error from
/// `on_timeout`.
///
/// # Errors
///
/// Returns `AppError::BackendUnavailable` if the binary cannot be started,
/// or the error built by `on_timeout`.
pub async fn run(
    bin: &str,
    args: &[String],
    bound: Duration,
    on_timeout: impl FnOnce(String) -> AppError,
) -> Result<CommandOutput> {
    match run_bounded(bin, args, bound).await? {
        Some(output) => Ok(output),
        None => Err(on_timeout(format!(
            "{bin} {} did not finish within {}s",
            args.first().map_or("", String::as_str),
            bound.as_secs()
        ))),
    }
}

/// Turn string slices into owned arguments.
#[must_use]
pub fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|p| (*p).to_owned()).collect()
}
