//! Global configuration parsing, validation, and environment overrides.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::{AppError, Result};

/// Environment variable overriding the directory that holds agent workdirs.
pub const BASE_DIR_ENV: &str = "AGENT_MANAGER_BASE_DIR";

/// Environment variable overriding the state directory (database, config).
pub const STATE_DIR_ENV: &str = "AGENT_MANAGER_STATE_DIR";

/// Supervised tool launched inside every backend instance.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct AgentCommandConfig {
    /// Executable name or path of the supervised interactive tool.
    pub command: String,
}

impl Default for AgentCommandConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
        }
    }
}

fn default_agent_command() -> String {
    "claude".into()
}

/// Local session (tmux) backend settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct SessionConfig {
    /// tmux binary.
    pub tmux_bin: String,
    /// Prefix for session names; the sweep recognises sessions by it.
    pub name_prefix: String,
    /// Extra arguments for the supervised command.
    pub command_args: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tmux_bin: "tmux".into(),
            name_prefix: default_name_prefix(),
            command_args: Vec::new(),
        }
    }
}

/// Isolated container (docker) backend settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct ContainerConfig {
    /// docker binary.
    pub docker_bin: String,
    /// Base execution image, built on first use when absent.
    pub image: String,
    /// Directory holding the Dockerfile for the base image.
    pub build_context: Option<PathBuf>,
    /// Prefix for container names; the sweep recognises containers by it.
    pub name_prefix: String,
    /// Memory ceiling passed to `--memory`.
    pub memory: String,
    /// CPU ceiling passed to `--cpus`.
    pub cpus: String,
    /// Process-count ceiling passed to `--pids-limit`.
    pub pids_limit: u32,
    /// Default network mode; agents may override it at spawn time.
    pub network: String,
    /// In-container mount point of the working copy.
    pub mount_path: String,
    /// Host environment variables forwarded into the container when set.
    pub forward_env: Vec<String>,
    /// Extra arguments for the supervised command.
    pub command_args: Vec<String>,
    /// Command run inside the container when attaching.
    pub attach_command: Vec<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".into(),
            image: "claude-agent:latest".into(),
            build_context: None,
            name_prefix: default_name_prefix(),
            memory: "2g".into(),
            cpus: "2".into(),
            pids_limit: 100,
            network: "none".into(),
            mount_path: "/workspace".into(),
            forward_env: vec!["ANTHROPIC_API_KEY".into()],
            command_args: vec!["--dangerously-skip-permissions".into()],
            attach_command: vec!["/bin/bash".into()],
        }
    }
}

fn default_name_prefix() -> String {
    "agent-".into()
}

/// Bounds (seconds) applied to substrate calls.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct TimeoutConfig {
    /// Liveness probe bound.
    pub probe_seconds: u64,
    /// Instance creation bound, including a first-use image build.
    pub create_seconds: u64,
    /// Grace period between a graceful terminate and a forced kill.
    pub terminate_grace_seconds: u64,
    /// Age after which a handle-less `spawning` record counts as interrupted.
    pub spawn_deadline_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            probe_seconds: 5,
            create_seconds: 600,
            terminate_grace_seconds: 10,
            spawn_deadline_seconds: 900,
        }
    }
}

impl TimeoutConfig {
    /// Probe bound as a [`Duration`].
    #[must_use]
    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_seconds)
    }

    /// Creation bound as a [`Duration`].
    #[must_use]
    pub fn create(&self) -> Duration {
        Duration::from_secs(self.create_seconds)
    }

    /// Terminate grace period as a [`Duration`].
    #[must_use]
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_seconds)
    }

    /// Overall bound for terminate and destroy calls: grace plus slack.
    #[must_use]
    pub fn teardown(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_seconds + 30)
    }

    /// How often an in-progress spawn refreshes its record: a third of
    /// the deadline, so two missed beats still leave it unexpired.
    #[must_use]
    pub fn spawn_heartbeat(&self) -> Duration {
        Duration::from_secs((self.spawn_deadline_seconds / 3).max(1))
    }

    /// Interrupted-spawn deadline as a [`chrono::Duration`].
    #[must_use]
    pub fn spawn_deadline(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.spawn_deadline_seconds).unwrap_or(i64::MAX))
    }
}

/// Periodic reconciliation settings for `am watch`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct ReconcileConfig {
    /// Seconds between passes.
    pub interval_seconds: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
        }
    }
}

/// Session bridge settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct BridgeConfig {
    /// Detach key, written as `ctrl-<char>` (e.g. `ctrl-]`, `ctrl-q`).
    pub detach_key: String,
    /// Whether bridged output is appended to the agent's output log.
    pub capture_output: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            detach_key: "ctrl-]".into(),
            capture_output: true,
        }
    }
}

impl BridgeConfig {
    /// Byte the terminal sends for the configured detach key.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the key is not `ctrl-` followed by a
    /// letter or one of `[ \ ] ^ _`.
    pub fn detach_byte(&self) -> Result<u8> {
        parse_ctrl_key(&self.detach_key)
    }
}

fn parse_ctrl_key(raw: &str) -> Result<u8> {
    let lowered = raw.trim().to_ascii_lowercase();
    let Some(rest) = lowered.strip_prefix("ctrl-") else {
        return Err(AppError::Config(format!(
            "detach_key must look like ctrl-<char>, got {raw}"
        )));
    };
    match rest.as_bytes() {
        [byte @ b'a'..=b'z'] => Ok(*byte - b'a' + 1),
        [byte @ (b'[' | b'\\' | b']' | b'^' | b'_')] => Ok(*byte - b'@'),
        _ => Err(AppError::Config(format!("unsupported detach_key {raw}"))),
    }
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct GlobalConfig {
    /// Directory holding the database and default config file.
    pub state_dir: PathBuf,
    /// Root of per-agent working copies; defaults to `<state_dir>/agents`.
    pub agents_dir: Option<PathBuf>,
    /// Supervised tool.
    pub agent: AgentCommandConfig,
    /// Local session backend.
    pub session: SessionConfig,
    /// Isolated container backend.
    pub container: ContainerConfig,
    /// Substrate call bounds.
    pub timeouts: TimeoutConfig,
    /// Periodic reconciliation.
    pub reconcile: ReconcileConfig,
    /// Session bridge.
    pub bridge: BridgeConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            agents_dir: None,
            agent: AgentCommandConfig::default(),
            session: SessionConfig::default(),
            container: ContainerConfig::default(),
            timeouts: TimeoutConfig::default(),
            reconcile: ReconcileConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir().map_or_else(
        || PathBuf::from(".agent-manager"),
        |home| home.join(".agent-manager"),
    )
}

impl GlobalConfig {
    /// Load configuration from `path`, or from `<state_dir>/config.toml`
    /// when present, falling back to defaults. Environment overrides are
    /// applied last.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if an explicit file cannot be read, if any
    /// file contains invalid TOML, or if validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_path(path)?,
            None => {
                let implicit = env::var_os(STATE_DIR_ENV)
                    .map_or_else(default_state_dir, PathBuf::from)
                    .join("config.toml");
                if implicit.is_file() {
                    debug!(path = %implicit.display(), "loading implicit config");
                    Self::load_from_path(&implicit)?
                } else {
                    Self::from_toml_str("")?
                }
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Path of the `SQLite` database.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("agents.db")
    }

    /// Root directory of per-agent working copies.
    #[must_use]
    pub fn agents_dir(&self) -> PathBuf {
        self.agents_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("agents"))
    }

    /// Working directory for a given agent id.
    #[must_use]
    pub fn agent_workdir(&self, agent_id: &str) -> PathBuf {
        self.agents_dir().join(agent_id)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(state) = env::var_os(STATE_DIR_ENV) {
            self.state_dir = PathBuf::from(state);
        }
        if let Some(base) = env::var_os(BASE_DIR_ENV) {
            self.agents_dir = Some(PathBuf::from(base));
        }
    }

    fn validate(&self) -> Result<()> {
        if self.timeouts.probe_seconds == 0 {
            return Err(AppError::Config("timeouts.probe_seconds must be > 0".into()));
        }
        if self.timeouts.create_seconds == 0 {
            return Err(AppError::Config("timeouts.create_seconds must be > 0".into()));
        }
        if self.timeouts.spawn_deadline_seconds < 3 {
            return Err(AppError::Config(
                "timeouts.spawn_deadline_seconds must be >= 3".into(),
            ));
        }
        if self.timeouts.spawn_deadline_seconds <= self.timeouts.probe_seconds {
            return Err(AppError::Config(
                "timeouts.spawn_deadline_seconds must exceed timeouts.probe_seconds".into(),
            ));
        }
        if self.reconcile.interval_seconds == 0 {
            return Err(AppError::Config(
                "reconcile.interval_seconds must be > 0".into(),
            ));
        }
        if self.session.name_prefix.is_empty() || self.container.name_prefix.is_empty() {
            return Err(AppError::Config("name_prefix must not be empty".into()));
        }
        if self.container.image.trim().is_empty() {
            return Err(AppError::Config("container.image must not be empty".into()));
        }
        if self.container.attach_command.is_empty() {
            return Err(AppError::Config(
                "container.attach_command must not be empty".into(),
            ));
        }
        if self.agent.command.trim().is_empty() {
            return Err(AppError::Config("agent.command must not be empty".into()));
        }
        self.bridge.detach_byte()?;
        Ok(())
    }
}
