//! Ordered teardown of agents and the substrate orphan sweep.
//!
//! Teardown of one agent always runs terminate, destroy, workdir removal
//! and record deletion in that order, stopping at the first failure so a
//! record is never dropped while its instance may still be alive.

use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use super::locks::AgentLocks;
use crate::backend::{BackendRegistry, ExecutionBackend};
use crate::models::agent::{AgentRecord, AgentStatus, BackendKind};
use crate::persistence::agent_repo::AgentRepo;
use crate::{AppError, Result};

/// Result of tearing down one agent during a bulk clean.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanOutcome {
    /// Agent that was processed.
    pub agent_id: String,
    /// Failure detail, `None` when fully torn down.
    pub error: Option<String>,
}

impl CleanOutcome {
    /// Whether the agent was fully removed.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Which substrates the orphan sweep visits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOptions {
    /// Restrict the sweep to these kinds; every registered kind when empty.
    pub kinds: Vec<BackendKind>,
    /// List what would be destroyed without destroying it.
    pub dry_run: bool,
}

/// An instance destroyed (or selected) by the sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweptInstance {
    /// Substrate the instance lives on.
    pub kind: BackendKind,
    /// Agent id recovered from the instance name.
    pub agent_id: String,
    /// Substrate handle.
    pub handle: String,
    /// Why it was selected.
    pub reason: &'static str,
}

/// Outcome of an orphan sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Instances destroyed (or that would be, on a dry run).
    pub removed: Vec<SweptInstance>,
    /// Per-substrate or per-instance failures.
    pub errors: Vec<String>,
}

/// `terminate` then `destroy` a handle, each bounded by `bound`.
///
/// Absence reported by the substrate counts as success.
///
/// # Errors
///
/// Returns the first substrate failure, or `AppError::BackendUnavailable`
/// if a call exceeds its bound.
pub async fn stop_instance(
    backend: &dyn ExecutionBackend,
    handle: &str,
    bound: Duration,
) -> Result<()> {
    bounded("terminate", bound, backend.terminate(handle)).await?;
    bounded("destroy", bound, backend.destroy(handle)).await
}

async fn bounded(
    step: &str,
    bound: Duration,
    call: impl std::future::Future<Output = Result<()>>,
) -> Result<()> {
    match tokio::time::timeout(bound, call).await {
        Err(_) => Err(AppError::BackendUnavailable(format!(
            "{step} did not finish within {}s",
            bound.as_secs()
        ))),
        Ok(Err(err)) if err.is_absence() => Ok(()),
        Ok(result) => result,
    }
}

/// Remove a working copy; a missing directory is fine.
///
/// # Errors
///
/// Returns `AppError::Io` if the directory exists and cannot be removed.
pub async fn remove_workdir(workdir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(workdir).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(AppError::Io(format!(
            "failed to remove workdir {}: {err}",
            workdir.display()
        ))),
    }
}

/// Fully tear down one agent: stop its instance, remove its workdir, delete
/// its record.
///
/// # Errors
///
/// Returns the first failing step's error; later steps are not attempted.
pub async fn teardown_agent(
    agents: &AgentRepo,
    registry: &BackendRegistry,
    record: &AgentRecord,
    bound: Duration,
) -> Result<()> {
    let span = info_span!(
        "teardown",
        agent_id = %record.id,
        backend = %record.backend_kind
    );
    async {
        if let Some(handle) = record.handle() {
            let backend = registry.get(record.backend_kind)?;
            stop_instance(backend.as_ref(), handle, bound).await?;
        }
        if record.status.is_live() {
            agents
                .mark_stopped(&record.id, &[AgentStatus::Spawning, AgentStatus::Running])
                .await?;
        }
        remove_workdir(&record.workdir).await?;
        agents.delete(&record.id).await?;
        info!("agent removed");
        Ok(())
    }
    .instrument(span)
    .await
}

/// Destroy substrate instances that no store record accounts for.
///
/// An instance is swept when its agent id has no record, or when the
/// record is `stopped`/`error` (which must not have a live instance).
/// Each candidate is judged against a fresh read of its record taken under
/// the agent's lock, after the instance was listed, so an agent spawned or
/// respawned while the sweep runs keeps its new instance.
///
/// # Errors
///
/// Returns `AppError::Db` if the store cannot be read; substrate failures
/// are collected in the report instead.
pub async fn sweep_orphans(
    agents: &AgentRepo,
    registry: &BackendRegistry,
    locks: &AgentLocks,
    options: &SweepOptions,
    bound: Duration,
) -> Result<SweepReport> {
    let mut report = SweepReport::default();
    for (kind, backend, inventory) in registry.inventories() {
        if !options.kinds.is_empty() && !options.kinds.contains(&kind) {
            continue;
        }
        let instances = match inventory.list_instances().await {
            Ok(instances) => instances,
            Err(err) => {
                warn!(%err, backend = %kind, "sweep: cannot list instances");
                report.errors.push(format!("{kind}: {err}"));
                continue;
            }
        };

        for instance in instances {
            let _guard = locks.lock(&instance.agent_id).await;
            let reason = match agents.get(&instance.agent_id).await? {
                None => "no record",
                Some(record) if record.status.is_live() => continue,
                Some(_) => "record not live",
            };
            if !options.dry_run {
                if let Err(err) = bounded("destroy", bound, backend.destroy(&instance.handle)).await
                {
                    warn!(%err, handle = %instance.handle, "sweep: destroy failed");
                    report
                        .errors
                        .push(format!("{kind} {}: {err}", instance.handle));
                    continue;
                }
                info!(backend = %kind, handle = %instance.handle, reason, "orphan destroyed");
            }
            report.removed.push(SweptInstance {
                kind,
                agent_id: instance.agent_id,
                handle: instance.handle,
                reason,
            });
        }
    }
    Ok(report)
}
