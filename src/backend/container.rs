//! Isolated container backend: one resource-capped docker container per
//! agent.
//!
//! The container runs a keep-alive entrypoint with the working copy
//! bind-mounted; the supervised command is started inside it with
//! `docker exec -d`. Containers run with `--rm`, so a stopped container
//! removes itself.

use std::path::Path;

use tracing::{info, info_span, warn, Instrument};

use super::command::{self, CommandOutput};
use super::pty::{self, TermSize};
use super::{
    agent_id_from_name, AttachStream, BackendFuture, ExecutionBackend, InstanceInventory,
    InstanceRef, Liveness,
};
use crate::config::{AgentCommandConfig, ContainerConfig, TimeoutConfig};
use crate::models::agent::AgentConfig;
use crate::{AppError, Result};

/// docker-backed [`ExecutionBackend`].
#[derive(Debug, Clone)]
pub struct ContainerBackend {
    agent: AgentCommandConfig,
    container: ContainerConfig,
    timeouts: TimeoutConfig,
}

impl ContainerBackend {
    /// Create a backend from configuration.
    #[must_use]
    pub fn new(
        agent: AgentCommandConfig,
        container: ContainerConfig,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            agent,
            container,
            timeouts,
        }
    }

    /// Container name for an agent.
    #[must_use]
    pub fn container_name(&self, agent_id: &str) -> String {
        format!("{}{agent_id}", self.container.name_prefix)
    }

    async fn docker(&self, args: &[String], bound: std::time::Duration) -> Result<CommandOutput> {
        command::run(&self.container.docker_bin, args, bound, AppError::BackendUnavailable).await
    }

    /// Fail with `BackendUnavailable` unless the docker daemon answers.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BackendUnavailable` if the binary is missing or
    /// the daemon is not running.
    pub async fn preflight(&self) -> Result<()> {
        let out = self
            .docker(
                &command::args(["info", "--format", "{{.ServerVersion}}"]),
                self.timeouts.probe(),
            )
            .await?;
        if out.success {
            Ok(())
        } else {
            Err(AppError::BackendUnavailable(format!(
                "docker daemon is not running: {}",
                out.stderr
            )))
        }
    }

    /// Make sure the base image exists, building it when absent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ImageBuildFailed` if the image is missing and
    /// cannot be built.
    pub async fn ensure_image(&self) -> Result<()> {
        let image = &self.container.image;
        let inspect = self
            .docker(
                &command::args(["image", "inspect", "--format", "{{.Id}}", image]),
                self.timeouts.probe(),
            )
            .await?;
        if inspect.success {
            return Ok(());
        }

        let Some(context) = &self.container.build_context else {
            return Err(AppError::ImageBuildFailed(format!(
                "image {image} is not present and no build_context is configured"
            )));
        };

        info!(image, context = %context.display(), "building base image");
        let mut args = command::args(["build", "-t", image]);
        args.push(context.to_string_lossy().into_owned());
        let out = command::run(
            &self.container.docker_bin,
            &args,
            self.timeouts.create(),
            AppError::ImageBuildFailed,
        )
        .await?;
        out.into_stdout(|stderr| AppError::ImageBuildFailed(format!("docker build: {stderr}")))
            .map(|_| ())
    }

    /// Remove the base image and prune dangling images.
    ///
    /// Returns whether the base image was removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BackendUnavailable` if docker cannot be reached.
    pub async fn purge_images(&self) -> Result<bool> {
        let removed = self
            .docker(
                &command::args(["rmi", "-f", &self.container.image]),
                self.timeouts.teardown(),
            )
            .await?;
        if !removed.success {
            warn!(image = %self.container.image, stderr = %removed.stderr, "base image not removed");
        }
        let pruned = self
            .docker(&command::args(["image", "prune", "-f"]), self.timeouts.teardown())
            .await?;
        if !pruned.success {
            warn!(stderr = %pruned.stderr, "image prune failed");
        }
        Ok(removed.success)
    }

    async fn force_remove(&self, reference: &str) -> Result<()> {
        let out = self
            .docker(&command::args(["rm", "-f", reference]), self.timeouts.teardown())
            .await?;
        if out.success || is_missing_container(&out.stderr) {
            Ok(())
        } else {
            Err(classify_failure(&out.stderr, AppError::BackendUnavailable))
        }
    }

    async fn create_inner(
        &self,
        agent_id: &str,
        workdir: &Path,
        config: &AgentConfig,
    ) -> Result<String> {
        self.preflight().await?;
        self.ensure_image().await?;

        let name = self.container_name(agent_id);
        let forwarded: Vec<&str> = self
            .container
            .forward_env
            .iter()
            .map(String::as_str)
            .filter(|key| std::env::var_os(key).is_some())
            .collect();

        let run = run_args(&name, workdir, &self.container, config, &forwarded);
        let out = self.docker(&run, self.timeouts.create()).await?;
        if !out.success {
            // docker may have registered the name before failing.
            if let Err(err) = self.force_remove(&name).await {
                warn!(%err, container = %name, "cleanup after failed run did not complete");
            }
            return Err(classify_failure(&out.stderr, |msg| {
                AppError::CreateFailed(format!("docker run: {msg}"))
            }));
        }
        let container_id = out.stdout.lines().last().unwrap_or_default().trim().to_owned();
        if container_id.is_empty() {
            if let Err(err) = self.force_remove(&name).await {
                warn!(%err, container = %name, "cleanup after id-less run did not complete");
            }
            return Err(AppError::CreateFailed("docker run returned no container id".into()));
        }

        let exec = exec_args(&container_id, &self.agent, &self.container, config, &forwarded);
        let started = self.docker(&exec, self.timeouts.create()).await;
        let failure = match started {
            Ok(out) if out.success => None,
            Ok(out) => Some(AppError::CreateFailed(format!("docker exec: {}", out.stderr))),
            Err(err) => Some(err),
        };
        if let Some(err) = failure {
            if let Err(cleanup) = self.force_remove(&container_id).await {
                warn!(%cleanup, container = %name, "cleanup after failed exec did not complete");
            }
            return Err(err);
        }

        info!(container = %name, id = %short_id(&container_id), "container started");
        Ok(container_id)
    }

    async fn probe_inner(&self, handle: &str) -> Result<Liveness> {
        let out = command::run(
            &self.container.docker_bin,
            &command::args(["inspect", "--format", "{{.State.Running}}", handle]),
            self.timeouts.probe(),
            AppError::ProbeTimeout,
        )
        .await?;
        if out.success {
            return Ok(if out.stdout.trim() == "true" {
                Liveness::Alive
            } else {
                Liveness::Gone
            });
        }
        if is_missing_container(&out.stderr) {
            Ok(Liveness::Gone)
        } else {
            Err(classify_failure(&out.stderr, AppError::BackendUnavailable))
        }
    }

    async fn terminate_inner(&self, handle: &str) -> Result<()> {
        let grace = self.timeouts.terminate_grace_seconds.to_string();
        let out = self
            .docker(
                &command::args(["stop", "-t", &grace, handle]),
                self.timeouts.teardown(),
            )
            .await?;
        if out.success || is_missing_container(&out.stderr) {
            Ok(())
        } else {
            Err(classify_failure(&out.stderr, AppError::BackendUnavailable))
        }
    }
}

impl ExecutionBackend for ContainerBackend {
    fn create<'a>(
        &'a self,
        agent_id: &'a str,
        workdir: &'a Path,
        config: &'a AgentConfig,
    ) -> BackendFuture<'a, String> {
        let span = info_span!("container_create", agent_id, backend = "container");
        Box::pin(self.create_inner(agent_id, workdir, config).instrument(span))
    }

    fn probe<'a>(&'a self, handle: &'a str) -> BackendFuture<'a, Liveness> {
        Box::pin(self.probe_inner(handle))
    }

    fn attach<'a>(&'a self, handle: &'a str) -> BackendFuture<'a, AttachStream> {
        Box::pin(async move {
            if self.probe_inner(handle).await? == Liveness::Gone {
                return Err(AppError::NotRunning(format!(
                    "container {} is not running",
                    short_id(handle)
                )));
            }
            let mut args = command::args(["exec", "-it", handle]);
            args.extend(self.container.attach_command.iter().cloned());
            pty::spawn_attach(&self.container.docker_bin, &args, TermSize::detect().await)
        })
    }

    fn terminate<'a>(&'a self, handle: &'a str) -> BackendFuture<'a, ()> {
        let span = info_span!("container_terminate", handle, backend = "container");
        Box::pin(self.terminate_inner(handle).instrument(span))
    }

    fn destroy<'a>(&'a self, handle: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(self.force_remove(handle))
    }
}

impl InstanceInventory for ContainerBackend {
    fn list_instances(&self) -> BackendFuture<'_, Vec<InstanceRef>> {
        Box::pin(async move {
            let filter = format!("name=^{}", self.container.name_prefix);
            let out = self
                .docker(
                    &command::args(["ps", "-a", "--filter", &filter, "--format", "{{.ID}} {{.Names}}"]),
                    self.timeouts.probe(),
                )
                .await?;
            let stdout = out.into_stdout(|stderr| {
                classify_failure(&stderr, |msg| {
                    AppError::BackendUnavailable(format!("docker ps: {msg}"))
                })
            })?;
            Ok(parse_container_list(&self.container.name_prefix, &stdout))
        })
    }
}

/// Arguments for the keep-alive `docker run`.
#[must_use]
pub fn run_args(
    name: &str,
    workdir: &Path,
    container: &ContainerConfig,
    config: &AgentConfig,
    forwarded_env: &[&str],
) -> Vec<String> {
    let network = config.network.as_deref().unwrap_or(&container.network);
    let memory = config.memory.as_deref().unwrap_or(&container.memory);
    let cpus = config.cpus.as_deref().unwrap_or(&container.cpus);
    let mount = format!("{}:{}", workdir.to_string_lossy(), container.mount_path);
    let pids = container.pids_limit.to_string();

    let mut args = command::args([
        "run",
        "-d",
        "--name",
        name,
        "--network",
        network,
        "-v",
        &mount,
        "-w",
        &container.mount_path,
        "--init",
        "--rm",
        "--memory",
        memory,
        "--cpus",
        cpus,
        "--pids-limit",
        &pids,
    ]);
    push_env(&mut args, config, forwarded_env);
    args.push(container.image.clone());
    args.push("sleep".into());
    args.push("infinity".into());
    args
}

/// Arguments for the `docker exec -d` that launches the supervised command.
#[must_use]
pub fn exec_args(
    container_id: &str,
    agent: &AgentCommandConfig,
    container: &ContainerConfig,
    config: &AgentConfig,
    forwarded_env: &[&str],
) -> Vec<String> {
    let mut args = command::args(["exec", "-d", "-w", &container.mount_path]);
    push_env(&mut args, config, forwarded_env);
    args.push(container_id.to_owned());
    args.push(agent.command.clone());
    args.extend(
        config
            .command_args
            .clone()
            .unwrap_or_else(|| container.command_args.clone()),
    );
    args
}

/// Forwarded variables are passed by name only so their values never
/// appear on a command line.
fn push_env(args: &mut Vec<String>, config: &AgentConfig, forwarded_env: &[&str]) {
    for key in forwarded_env {
        args.push("-e".into());
        args.push((*key).to_owned());
    }
    for (key, value) in &config.env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }
}

/// Whether docker stderr says the container does not exist.
#[must_use]
pub fn is_missing_container(stderr: &str) -> bool {
    let lowered = stderr.to_ascii_lowercase();
    lowered.contains("no such container") || lowered.contains("no such object")
}

/// Whether docker stderr says the daemon cannot be reached.
#[must_use]
pub fn is_daemon_down(stderr: &str) -> bool {
    let lowered = stderr.to_ascii_lowercase();
    lowered.contains("cannot connect to the docker daemon")
        || lowered.contains("is the docker daemon running")
        || lowered.contains("error during connect")
}

fn classify_failure(stderr: &str, otherwise: impl FnOnce(String) -> AppError) -> AppError {
    if is_daemon_down(stderr) {
        AppError::BackendUnavailable(format!("docker daemon unreachable: {stderr}"))
    } else {
        otherwise(stderr.to_owned())
    }
}

/// Parse `docker ps --format '{{.ID}} {{.Names}}'` output into agent
/// instances.
#[must_use]
pub fn parse_container_list(prefix: &str, stdout: &str) -> Vec<InstanceRef> {
    stdout
        .lines()
        .filter_map(|line| {
            let (id, name) = line.trim().split_once(' ')?;
            agent_id_from_name(prefix, name.trim()).map(|agent_id| InstanceRef {
                agent_id: agent_id.to_owned(),
                handle: id.to_owned(),
            })
        })
        .collect()
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
