//! Raw-mode handling for the invoking terminal.

use std::io::IsTerminal;

use crate::Result;

/// Puts stdin into raw mode for its lifetime and restores the previous
/// settings on drop.
#[derive(Debug)]
pub struct RawModeGuard {
    #[cfg(unix)]
    saved: Option<nix::sys::termios::Termios>,
}

impl RawModeGuard {
    /// Switch stdin to raw mode. A no-op when stdin is not a terminal.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the terminal attributes cannot be changed.
    #[cfg(unix)]
    pub fn enable() -> Result<Self> {
        use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};

        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            return Ok(Self { saved: None });
        }
        let saved = tcgetattr(&stdin)
            .map_err(|err| crate::AppError::Io(format!("failed to read terminal mode: {err}")))?;
        let mut raw = saved.clone();
        cfmakeraw(&mut raw);
        tcsetattr(&stdin, SetArg::TCSANOW, &raw)
            .map_err(|err| crate::AppError::Io(format!("failed to enter raw mode: {err}")))?;
        Ok(Self { saved: Some(saved) })
    }

    /// Raw mode is unsupported off unix; the guard does nothing.
    ///
    /// # Errors
    ///
    /// Never fails.
    #[cfg(not(unix))]
    pub fn enable() -> Result<Self> {
        Ok(Self {})
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(saved) = self.saved.take() {
            use nix::sys::termios::{tcsetattr, SetArg};
            if let Err(err) = tcsetattr(&std::io::stdin(), SetArg::TCSANOW, &saved) {
                tracing::warn!(%err, "failed to restore terminal mode");
            }
        }
    }
}

/// Whether stdin is an interactive terminal.
#[must_use]
pub fn stdin_is_terminal() -> bool {
    std::io::stdin().is_terminal()
}
