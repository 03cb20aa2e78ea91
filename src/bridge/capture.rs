//! Tee of bridged terminal output into the agent's output log.
//!
//! Raw terminal bytes are split into lines, stripped of escape sequences
//! and carriage returns, and handed in batches to a background writer.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::models::output::OutputKind;
use crate::persistence::output_repo::OutputRepo;

/// Lines buffered between the relay and the writer task.
const CAPTURE_DEPTH: usize = 1024;

/// Longest partial line kept before it is flushed as-is.
const MAX_LINE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escape {
    None,
    Esc,
    Csi,
    Osc,
    OscEsc,
}

/// Incremental splitter turning terminal output into printable lines.
#[derive(Debug)]
pub struct LineSplitter {
    current: Vec<u8>,
    escape: Escape,
}

impl Default for LineSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl LineSplitter {
    /// Empty splitter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: Vec::new(),
            escape: Escape::None,
        }
    }

    /// Feed a chunk and return the lines it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            self.escape = match (self.escape, byte) {
                (Escape::None, 0x1b) => Escape::Esc,
                (Escape::None, _) => {
                    self.push_plain(byte, &mut lines);
                    Escape::None
                }
                (Escape::Esc, b'[') => Escape::Csi,
                (Escape::Esc, b']') => Escape::Osc,
                (Escape::Osc, 0x1b) => Escape::OscEsc,
                (Escape::Esc | Escape::Csi, 0x40..=0x7e)
                | (Escape::Osc, 0x07)
                | (Escape::OscEsc, _) => Escape::None,
                (state, _) => state,
            };
        }
        lines
    }

    /// Flush whatever partial line remains.
    pub fn finish(&mut self) -> Option<String> {
        if self.current.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn push_plain(&mut self, byte: u8, lines: &mut Vec<String>) {
        match byte {
            b'\n' => lines.push(self.take_line()),
            b'\t' | 0x20.. => {
                self.current.push(byte);
                if self.current.len() >= MAX_LINE {
                    lines.push(self.take_line());
                }
            }
            _ => {}
        }
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.current).trim_end().to_owned();
        self.current.clear();
        line
    }
}

/// Relay-side handle of an output capture.
#[derive(Debug)]
pub struct OutputCapture {
    splitter: LineSplitter,
    tx: mpsc::Sender<Vec<String>>,
    task: JoinHandle<()>,
}

impl OutputCapture {
    /// Start a writer task appending captured lines for `agent_id`.
    #[must_use]
    pub fn spawn(repo: OutputRepo, agent_id: String) -> Self {
        let (tx, rx) = mpsc::channel(CAPTURE_DEPTH);
        let task = spawn_capture_task(repo, agent_id, rx);
        Self {
            splitter: LineSplitter::new(),
            tx,
            task,
        }
    }

    /// Feed relayed bytes. Never blocks the relay: if the writer falls
    /// behind, the batch is dropped.
    pub fn feed(&mut self, chunk: &[u8]) {
        let lines: Vec<String> = self
            .splitter
            .feed(chunk)
            .into_iter()
            .filter(|l| !l.is_empty())
            .collect();
        if !lines.is_empty() && self.tx.try_send(lines).is_err() {
            debug!("output capture lagging, dropping lines");
        }
    }

    /// Flush the trailing partial line and wait for the writer to drain.
    pub async fn finish(mut self) {
        if let Some(last) = self.splitter.finish().filter(|l| !l.is_empty()) {
            let _ = self.tx.send(vec![last]).await;
        }
        drop(self.tx);
        if let Err(err) = self.task.await {
            debug!(%err, "output capture task failed");
        }
    }
}

fn spawn_capture_task(
    repo: OutputRepo,
    agent_id: String,
    mut rx: mpsc::Receiver<Vec<String>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(lines) = rx.recv().await {
            if let Err(err) = repo
                .append_many(&agent_id, OutputKind::Terminal, &lines)
                .await
            {
                debug!(%err, agent_id = %agent_id, "failed to store captured output");
            }
        }
    })
}
