//! Attach clients run inside a pseudo-terminal.
//!
//! `tmux attach-session` and `docker exec -it` both insist on a terminal,
//! so the client is spawned on a pty and its master side is pumped through
//! a pair of channels by two blocking threads.

use std::io::{ErrorKind, Read, Write};

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::sync::mpsc;
use tracing::debug;

use super::AttachStream;
use crate::{AppError, Result};

const CHANNEL_DEPTH: usize = 256;
const READ_CHUNK: usize = 8192;

/// Terminal dimensions handed to the attach client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    /// Rows.
    pub rows: u16,
    /// Columns.
    pub cols: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl TermSize {
    /// Size of the invoking terminal, or the default when stdin is not one.
    pub async fn detect() -> Self {
        tokio::process::Command::new("stty")
            .arg("size")
            .stdin(std::process::Stdio::inherit())
            .stderr(std::process::Stdio::null())
            .output()
            .await
            .ok()
            .filter(|out| out.status.success())
            .and_then(|out| Self::parse_stty(&String::from_utf8_lossy(&out.stdout)))
            .unwrap_or_default()
    }

    /// Parse `stty size` output (`"<rows> <cols>"`).
    #[must_use]
    pub fn parse_stty(raw: &str) -> Option<Self> {
        let mut parts = raw.split_whitespace();
        let rows = parts.next()?.parse().ok()?;
        let cols = parts.next()?.parse().ok()?;
        if rows == 0 || cols == 0 {
            return None;
        }
        Some(Self { rows, cols })
    }
}

/// Spawn `program args...` on a fresh pty and expose it as an
/// [`AttachStream`].
///
/// Dropping the stream kills the client process (not the instance it is
/// attached to).
///
/// # Errors
///
/// Returns `AppError::Io` if the pty cannot be opened or the client cannot
/// be spawned.
pub fn spawn_attach(program: &str, args: &[String], size: TermSize) -> Result<AttachStream> {
    let pair = native_pty_system()
        .openpty(PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| AppError::Io(format!("failed to open pty: {e}")))?;

    let mut cmd = CommandBuilder::new(program);
    for arg in args {
        cmd.arg(arg);
    }
    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| AppError::Io(format!("failed to spawn {program}: {e}")))?;
    drop(pair.slave);

    let mut killer = child.clone_killer();
    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| AppError::Io(format!("failed to clone pty reader: {e}")))?;
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|e| AppError::Io(format!("failed to take pty writer: {e}")))?;

    let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);
    let (in_tx, mut in_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);

    std::thread::Builder::new()
        .name("attach-read".into())
        .spawn(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if out_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(err) => {
                        debug!(%err, "pty read ended");
                        break;
                    }
                }
            }
        })
        .map_err(|e| AppError::Io(format!("failed to start pty reader: {e}")))?;

    std::thread::Builder::new()
        .name("attach-write".into())
        .spawn(move || {
            while let Some(bytes) = in_rx.blocking_recv() {
                if writer.write_all(&bytes).and_then(|()| writer.flush()).is_err() {
                    break;
                }
            }
        })
        .map_err(|e| AppError::Io(format!("failed to start pty writer: {e}")))?;

    // Reap the client so it does not linger as a zombie; keep the master
    // alive until then so the reader sees EOF only when the client exits.
    let master = pair.master;
    std::thread::Builder::new()
        .name("attach-wait".into())
        .spawn(move || {
            let status = child.wait();
            debug!(?status, "attach client exited");
            drop(master);
        })
        .map_err(|e| AppError::Io(format!("failed to start pty waiter: {e}")))?;

    Ok(AttachStream::new(in_tx, out_rx).with_release(move || {
        if let Err(err) = killer.kill() {
            debug!(%err, "attach client already gone");
        }
    }))
}
