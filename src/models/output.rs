//! Captured output lines appended per agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Origin of a captured line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Lifecycle event written by the manager.
    System,
    /// Terminal output relayed by the session bridge.
    Terminal,
}

impl OutputKind {
    /// Storage form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Terminal => "terminal",
        }
    }
}

/// One line of the append-only output log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct OutputLine {
    /// Monotonic row id; defines append order.
    pub seq: i64,
    /// Owning agent.
    pub agent_id: String,
    /// When the line was appended.
    pub timestamp: DateTime<Utc>,
    /// Line origin.
    pub kind: OutputKind,
    /// Line text without trailing newline.
    pub content: String,
}
