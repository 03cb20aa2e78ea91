//! Agent record model and lifecycle helpers.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AppError, Result};

/// Lifecycle status for an agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Record exists; backend instance not yet confirmed live.
    Spawning,
    /// Backend instance confirmed live.
    Running,
    /// Stopped gracefully; no live instance.
    Stopped,
    /// Creation or liveness failure; no live instance.
    Error,
}

impl AgentStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 4] = [Self::Spawning, Self::Running, Self::Stopped, Self::Error];

    /// Storage and display form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// Statuses whose record may be backed by a live instance.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Spawning | Self::Running)
    }

    /// Whether a lifecycle transition is permitted.
    ///
    /// Same-status transitions are allowed so that reapplying a transition
    /// computed from stale data is harmless.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        self == next
            || matches!(
                (self, next),
                (Self::Spawning, Self::Running | Self::Stopped | Self::Error)
                    | (Self::Running, Self::Stopped | Self::Error)
                    | (Self::Stopped | Self::Error, Self::Spawning)
            )
    }
}

impl Display for AgentStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "spawning" => Ok(Self::Spawning),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            other => Err(AppError::Db(format!("invalid agent status: {other}"))),
        }
    }
}

/// Execution substrate that hosts an agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Host-level tmux session.
    Session,
    /// Network-isolated, resource-capped docker container.
    Container,
}

impl BackendKind {
    /// Storage and display form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Container => "container",
        }
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "session" => Ok(Self::Session),
            "container" => Ok(Self::Container),
            other => Err(AppError::Db(format!("invalid backend kind: {other}"))),
        }
    }
}

/// Per-agent overrides applied on top of the global backend settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct AgentConfig {
    /// Container network mode (`none`, `bridge`, ...); container backend only.
    pub network: Option<String>,
    /// Container memory ceiling override.
    pub memory: Option<String>,
    /// Container CPU ceiling override.
    pub cpus: Option<String>,
    /// Replacement arguments for the supervised command.
    pub command_args: Option<Vec<String>>,
    /// Extra environment for the supervised command.
    pub env: BTreeMap<String, String>,
}

/// Selection of agents for listing and bulk teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentFilter {
    /// Every agent.
    All,
    /// A single agent by id.
    Id(String),
    /// Agents currently in the given status.
    Status(AgentStatus),
}

impl AgentFilter {
    /// Whether `record` is selected.
    #[must_use]
    pub fn matches(&self, record: &AgentRecord) -> bool {
        match self {
            Self::All => true,
            Self::Id(id) => record.id == *id,
            Self::Status(status) => record.status == *status,
        }
    }
}

/// Lifecycle record persisted for every agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentRecord {
    /// Unique identifier; immutable and never reused.
    pub id: String,
    /// Repository the working copy was provisioned from.
    pub repo_url: String,
    /// Working copy on the host filesystem.
    pub workdir: PathBuf,
    /// Execution substrate; immutable after creation.
    pub backend_kind: BackendKind,
    /// Substrate identifier of the live instance, if any.
    pub backend_handle: Option<String>,
    /// Current lifecycle status.
    pub status: AgentStatus,
    /// Set once a graceful stop has been requested.
    pub stop_requested: bool,
    /// Overrides the agent was spawned with.
    pub config: AgentConfig,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last successful liveness probe.
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// Detail of the last failure.
    pub last_error: Option<String>,
}

impl AgentRecord {
    /// Construct a `spawning` record.
    #[must_use]
    pub fn new(
        id: String,
        repo_url: String,
        workdir: PathBuf,
        backend_kind: BackendKind,
        config: AgentConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            repo_url,
            workdir,
            backend_kind,
            backend_handle: None,
            status: AgentStatus::Spawning,
            stop_requested: false,
            config,
            created_at: now,
            last_seen_at: None,
            updated_at: now,
            last_error: None,
        }
    }

    /// Live handle, ignoring empty strings.
    #[must_use]
    pub fn handle(&self) -> Option<&str> {
        self.backend_handle.as_deref().filter(|h| !h.is_empty())
    }

    /// Whether the handle/status invariant holds for this record.
    ///
    /// `running` requires a handle; `stopped` and `error` forbid one;
    /// `spawning` may carry one once the instance exists.
    #[must_use]
    pub fn handle_consistent(&self) -> bool {
        match self.status {
            AgentStatus::Running => self.handle().is_some(),
            AgentStatus::Stopped | AgentStatus::Error => self.handle().is_none(),
            AgentStatus::Spawning => true,
        }
    }
}

/// Generate a fresh agent identifier.
#[must_use]
pub fn generate_agent_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}

/// Validate an explicit agent identifier.
///
/// Ids end up in session names, container names and paths, so they are
/// restricted to lowercase ASCII alphanumerics, `-` and `_`.
///
/// # Errors
///
/// Returns `AppError::Config` if the id is empty, too long, or contains
/// other characters.
pub fn validate_agent_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(AppError::Config(format!("invalid agent id: {id}")))
    }
}

/// Check that a repository reference looks cloneable.
///
/// # Errors
///
/// Returns `AppError::CreateFailed` if the URL has no recognised scheme and
/// is not an existing local directory.
pub fn validate_repo_url(repo_url: &str) -> Result<()> {
    const PREFIXES: [&str; 5] = ["http://", "https://", "git@", "git://", "file://"];
    if PREFIXES.iter().any(|p| repo_url.starts_with(p))
        || std::path::Path::new(repo_url).is_dir()
    {
        Ok(())
    } else {
        Err(AppError::CreateFailed(format!(
            "unrecognised repository url: {repo_url}"
        )))
    }
}
