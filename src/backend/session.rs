//! Local session backend: one detached tmux session per agent.
//!
//! The supervised command is the session's only pane process, so the
//! session disappears when the command exits and a probe reports `gone`.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, info_span, warn, Instrument};

use super::command::{self, CommandOutput};
use super::pty::{self, TermSize};
use super::{
    agent_id_from_name, AttachStream, BackendFuture, ExecutionBackend, InstanceInventory,
    InstanceRef, Liveness,
};
use crate::config::{AgentCommandConfig, SessionConfig, TimeoutConfig};
use crate::models::agent::AgentConfig;
use crate::{AppError, Result};

const TERMINATE_POLL: Duration = Duration::from_millis(200);

/// tmux-backed [`ExecutionBackend`].
#[derive(Debug, Clone)]
pub struct SessionBackend {
    agent: AgentCommandConfig,
    session: SessionConfig,
    timeouts: TimeoutConfig,
}

impl SessionBackend {
    /// Create a backend from configuration.
    #[must_use]
    pub fn new(agent: AgentCommandConfig, session: SessionConfig, timeouts: TimeoutConfig) -> Self {
        Self {
            agent,
            session,
            timeouts,
        }
    }

    /// Session name for an agent.
    #[must_use]
    pub fn session_name(&self, agent_id: &str) -> String {
        format!("{}{agent_id}", self.session.name_prefix)
    }

    async fn tmux(&self, args: &[String], bound: Duration) -> Result<CommandOutput> {
        command::run(&self.session.tmux_bin, args, bound, AppError::BackendUnavailable).await
    }

    async fn session_exists(&self, name: &str, bound: Duration) -> Result<bool> {
        let out = command::run(
            &self.session.tmux_bin,
            &has_session_args(name),
            bound,
            AppError::ProbeTimeout,
        )
        .await?;
        Ok(out.success)
    }

    async fn pane_pid(&self, name: &str) -> Result<Option<i32>> {
        let out = self
            .tmux(&pane_pid_args(name), self.timeouts.probe())
            .await?;
        if !out.success {
            return Ok(None);
        }
        Ok(out.stdout.lines().next().and_then(|l| l.trim().parse().ok()))
    }

    async fn kill_session(&self, name: &str) -> Result<()> {
        let out = self
            .tmux(&kill_session_args(name), self.timeouts.teardown())
            .await?;
        if !out.success && !is_missing_session(&out.stderr) {
            return Err(AppError::BackendUnavailable(format!(
                "tmux kill-session failed: {}",
                out.stderr
            )));
        }
        Ok(())
    }

    async fn create_inner(
        &self,
        agent_id: &str,
        workdir: &Path,
        config: &AgentConfig,
    ) -> Result<String> {
        let name = self.session_name(agent_id);

        if self.session_exists(&name, self.timeouts.probe()).await? {
            return Err(AppError::CreateFailed(format!(
                "tmux session {name} already exists"
            )));
        }

        let args = new_session_args(&name, workdir, &self.agent, &self.session, config);
        let out = self.tmux(&args, self.timeouts.create()).await?;
        if !out.success {
            // A failed new-session may still have registered the name.
            if let Err(err) = self.kill_session(&name).await {
                warn!(%err, session = %name, "cleanup after failed create did not complete");
            }
            return Err(AppError::CreateFailed(format!(
                "tmux new-session failed: {}",
                out.stderr
            )));
        }

        if !self.session_exists(&name, self.timeouts.probe()).await? {
            return Err(AppError::CreateFailed(format!(
                "{} exited immediately in session {name}",
                self.agent.command
            )));
        }

        info!(session = %name, "tmux session started");
        Ok(name)
    }

    async fn terminate_inner(&self, handle: &str) -> Result<()> {
        let Some(pid) = self.pane_pid(handle).await? else {
            debug!(session = %handle, "terminate: session already gone");
            return Ok(());
        };

        signal_term(pid);

        let deadline = tokio::time::Instant::now() + self.timeouts.terminate_grace();
        while tokio::time::Instant::now() < deadline {
            match self.session_exists(handle, self.timeouts.probe()).await {
                Ok(false) => return Ok(()),
                Ok(true) | Err(AppError::ProbeTimeout(_)) => {}
                Err(err) => return Err(err),
            }
            tokio::time::sleep(TERMINATE_POLL).await;
        }

        warn!(session = %handle, "grace period elapsed, killing session");
        self.kill_session(handle).await
    }
}

#[cfg(unix)]
fn signal_term(pid: i32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(err) => warn!(pid, %err, "failed to signal pane process"),
    }
}

#[cfg(not(unix))]
fn signal_term(_pid: i32) {}

impl ExecutionBackend for SessionBackend {
    fn create<'a>(
        &'a self,
        agent_id: &'a str,
        workdir: &'a Path,
        config: &'a AgentConfig,
    ) -> BackendFuture<'a, String> {
        let span = info_span!("session_create", agent_id, backend = "session");
        Box::pin(self.create_inner(agent_id, workdir, config).instrument(span))
    }

    fn probe<'a>(&'a self, handle: &'a str) -> BackendFuture<'a, Liveness> {
        Box::pin(async move {
            if self.session_exists(handle, self.timeouts.probe()).await? {
                Ok(Liveness::Alive)
            } else {
                Ok(Liveness::Gone)
            }
        })
    }

    fn attach<'a>(&'a self, handle: &'a str) -> BackendFuture<'a, AttachStream> {
        Box::pin(async move {
            if self.probe(handle).await? == Liveness::Gone {
                return Err(AppError::NotRunning(format!("tmux session {handle} is gone")));
            }
            pty::spawn_attach(
                &self.session.tmux_bin,
                &attach_session_args(handle),
                TermSize::detect().await,
            )
        })
    }

    fn terminate<'a>(&'a self, handle: &'a str) -> BackendFuture<'a, ()> {
        let span = info_span!("session_terminate", handle, backend = "session");
        Box::pin(self.terminate_inner(handle).instrument(span))
    }

    fn destroy<'a>(&'a self, handle: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(self.kill_session(handle))
    }
}

impl InstanceInventory for SessionBackend {
    fn list_instances(&self) -> BackendFuture<'_, Vec<InstanceRef>> {
        Box::pin(async move {
            let out = self
                .tmux(
                    &command::args(["list-sessions", "-F", "#{session_name}"]),
                    self.timeouts.probe(),
                )
                .await?;
            if !out.success {
                // No server means no sessions.
                if is_missing_session(&out.stderr) {
                    return Ok(Vec::new());
                }
                return Err(AppError::BackendUnavailable(format!(
                    "tmux list-sessions failed: {}",
                    out.stderr
                )));
            }
            Ok(parse_session_list(&self.session.name_prefix, &out.stdout))
        })
    }
}

/// Exact-match tmux target for a session name.
fn target(name: &str) -> String {
    format!("={name}")
}

/// Arguments for `tmux new-session` launching the supervised command.
#[must_use]
pub fn new_session_args(
    name: &str,
    workdir: &Path,
    agent: &AgentCommandConfig,
    session: &SessionConfig,
    config: &AgentConfig,
) -> Vec<String> {
    let mut args = command::args(["new-session", "-d", "-s", name, "-c"]);
    args.push(workdir.to_string_lossy().into_owned());
    for (key, value) in &config.env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }
    args.push("--".into());
    args.push(agent.command.clone());
    args.extend(
        config
            .command_args
            .clone()
            .unwrap_or_else(|| session.command_args.clone()),
    );
    args
}

/// Arguments for `tmux has-session`.
#[must_use]
pub fn has_session_args(name: &str) -> Vec<String> {
    vec!["has-session".into(), "-t".into(), target(name)]
}

/// Arguments for `tmux kill-session`.
#[must_use]
pub fn kill_session_args(name: &str) -> Vec<String> {
    vec!["kill-session".into(), "-t".into(), target(name)]
}

/// Arguments for `tmux attach-session`.
#[must_use]
pub fn attach_session_args(name: &str) -> Vec<String> {
    vec!["attach-session".into(), "-t".into(), target(name)]
}

/// Arguments for reading the pane pid of a session.
#[must_use]
pub fn pane_pid_args(name: &str) -> Vec<String> {
    vec![
        "display-message".into(),
        "-p".into(),
        "-t".into(),
        format!("{}:", target(name)),
        "#{pane_pid}".into(),
    ]
}

/// Whether tmux stderr says the session (or the whole server) is absent.
#[must_use]
pub fn is_missing_session(stderr: &str) -> bool {
    let lowered = stderr.to_ascii_lowercase();
    ["can't find session", "no server running", "error connecting to", "session not found"]
        .iter()
        .any(|needle| lowered.contains(needle))
}

/// Parse `list-sessions -F '#{session_name}'` output into agent instances.
#[must_use]
pub fn parse_session_list(prefix: &str, stdout: &str) -> Vec<InstanceRef> {
    stdout
        .lines()
        .map(str::trim)
        .filter_map(|name| {
            agent_id_from_name(prefix, name).map(|id| InstanceRef {
                agent_id: id.to_owned(),
                handle: name.to_owned(),
            })
        })
        .collect()
}
