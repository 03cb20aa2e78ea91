//! Session bridge: relays a controlling terminal to a running instance.
//!
//! A bridge owns one [`AttachStream`] and pumps bytes in both directions
//! until the operator detaches (detach key or cancellation) or the stream
//! closes. Detaching only drops the attach client; the instance keeps
//! running.

pub mod capture;
pub mod terminal;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use crate::backend::AttachStream;
use crate::{AppError, Result};

use self::capture::OutputCapture;
use self::terminal::RawModeGuard;

const INPUT_CHUNK: usize = 1024;

/// How a bridge ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// The operator typed the detach key or closed the input.
    Detached,
    /// The bridge was cancelled from outside.
    Cancelled,
}

/// Single-owner claim on the invoking terminal.
///
/// Only one bridge per process may relay the controlling terminal at a
/// time.
#[derive(Debug, Clone, Default)]
pub struct TerminalLease {
    held: Arc<AtomicBool>,
}

impl TerminalLease {
    /// Fresh, unheld lease.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the terminal.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyAttached` if another bridge holds it.
    pub fn acquire(&self, agent_id: &str) -> Result<LeaseGuard> {
        if self
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AppError::AlreadyAttached(format!(
                "terminal is already bridged; cannot attach {agent_id}"
            )));
        }
        Ok(LeaseGuard {
            held: Arc::clone(&self.held),
        })
    }

    /// Whether a bridge currently holds the terminal.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Releases the [`TerminalLease`] on drop.
#[derive(Debug)]
pub struct LeaseGuard {
    held: Arc<AtomicBool>,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}

/// An attached, not yet running, relay to one agent's terminal.
pub struct SessionBridge {
    agent_id: String,
    stream: AttachStream,
    detach_byte: u8,
    capture: Option<OutputCapture>,
    _lease: LeaseGuard,
}

impl std::fmt::Debug for SessionBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBridge")
            .field("agent_id", &self.agent_id)
            .field("detach_byte", &self.detach_byte)
            .field("capture", &self.capture.is_some())
            .finish_non_exhaustive()
    }
}

impl SessionBridge {
    /// Assemble a bridge from an open stream and a held lease.
    #[must_use]
    pub fn new(
        agent_id: String,
        stream: AttachStream,
        detach_byte: u8,
        capture: Option<OutputCapture>,
        lease: LeaseGuard,
    ) -> Self {
        Self {
            agent_id,
            stream,
            detach_byte,
            capture,
            _lease: lease,
        }
    }

    /// Agent this bridge is attached to.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Relay the process's own stdin/stdout, in raw mode while bridged.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionEnded` if the instance goes away first, or
    /// `AppError::Io` if the terminal cannot be driven.
    pub async fn run_terminal(self, cancel: CancellationToken) -> Result<BridgeOutcome> {
        let agent_id = self.agent_id.clone();
        let raw = RawModeGuard::enable()?;
        let outcome = self
            .run(tokio::io::stdin(), tokio::io::stdout(), cancel)
            .await;
        // stderr is only safe to log to once the terminal is cooked again.
        drop(raw);
        match &outcome {
            Ok(outcome) => info!(agent_id = %agent_id, ?outcome, "bridge closed"),
            Err(err) => info!(agent_id = %agent_id, %err, "bridge ended"),
        }
        outcome
    }

    /// Relay `input` to the instance and the instance's output to `output`
    /// until detach, cancellation, or end of stream.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionEnded` if the stream closes before the
    /// operator detaches, or `AppError::Io` if writing `output` fails.
    pub async fn run<R, W>(
        mut self,
        mut input: R,
        mut output: W,
        cancel: CancellationToken,
    ) -> Result<BridgeOutcome>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let span = info_span!("bridge", agent_id = %self.agent_id);
        let mut capture = self.capture.take();
        let result = relay(
            &mut self.stream,
            &mut input,
            &mut output,
            self.detach_byte,
            capture.as_mut(),
            &cancel,
        )
        .instrument(span)
        .await;

        if let Some(capture) = capture {
            capture.finish().await;
        }
        match &result {
            Ok(outcome) => debug!(agent_id = %self.agent_id, ?outcome, "bridge closed"),
            Err(err) => debug!(agent_id = %self.agent_id, %err, "bridge ended"),
        }
        result
    }
}

async fn relay<R, W>(
    stream: &mut AttachStream,
    input: &mut R,
    output: &mut W,
    detach_byte: u8,
    mut capture: Option<&mut OutputCapture>,
    cancel: &CancellationToken,
) -> Result<BridgeOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; INPUT_CHUNK];
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("bridge cancelled");
                return Ok(BridgeOutcome::Cancelled);
            }
            chunk = stream.output.recv() => {
                let Some(bytes) = chunk else {
                    output.flush().await?;
                    return Err(AppError::SessionEnded("attached stream closed".into()));
                };
                output.write_all(&bytes).await?;
                output.flush().await?;
                if let Some(capture) = capture.as_deref_mut() {
                    capture.feed(&bytes);
                }
            }
            read = input.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    debug!("bridge input closed");
                    return Ok(BridgeOutcome::Detached);
                }
                let chunk = &buf[..n];
                let (forward, detached) = match chunk.iter().position(|b| *b == detach_byte) {
                    Some(at) => (&chunk[..at], true),
                    None => (chunk, false),
                };
                if !forward.is_empty() && stream.input.send(forward.to_vec()).await.is_err() {
                    return Err(AppError::SessionEnded("attached stream closed".into()));
                }
                if detached {
                    return Ok(BridgeOutcome::Detached);
                }
            }
        }
    }
}
