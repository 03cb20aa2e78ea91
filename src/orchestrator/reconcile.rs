//! Reconciliation of store records against live substrate state.
//!
//! A pass probes every live record concurrently and repairs divergence
//! with compare-and-set writes keyed on the observed handle, so running the
//! same pass twice (or two passes at once) never double-applies anything.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use super::locks::AgentLocks;
use super::manager::AgentManager;
use crate::backend::{BackendRegistry, Liveness};
use crate::config::TimeoutConfig;
use crate::models::agent::{AgentRecord, AgentStatus};
use crate::models::output::OutputKind;
use crate::persistence::agent_repo::AgentRepo;
use crate::persistence::output_repo::OutputRepo;
use crate::{AppError, Result};

/// A status change applied by a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    /// Agent whose record changed.
    pub agent_id: String,
    /// Status observed before the pass.
    pub from: AgentStatus,
    /// Status written by the pass.
    pub to: AgentStatus,
    /// Why.
    pub reason: String,
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Live records examined.
    pub checked: usize,
    /// Records confirmed alive.
    pub alive: usize,
    /// Transitions applied.
    pub transitions: Vec<Transition>,
    /// Records left untouched because the substrate did not answer.
    pub deferred: Vec<(String, String)>,
}

impl ReconcileReport {
    /// Whether the pass changed any record's status.
    #[must_use]
    pub fn changed(&self) -> bool {
        !self.transitions.is_empty()
    }
}

enum Verdict {
    Alive,
    Moved(Transition),
    Unchanged,
    Deferred(String),
}

/// Everything a pass needs, borrowed from the manager.
pub struct PassContext<'a> {
    /// Agent records.
    pub agents: &'a AgentRepo,
    /// Output log for lifecycle events.
    pub output: &'a OutputRepo,
    /// Backend lookup.
    pub registry: &'a BackendRegistry,
    /// Per-id serialization.
    pub locks: &'a AgentLocks,
    /// Probe bound and spawn deadline.
    pub timeouts: &'a TimeoutConfig,
}

/// Run one pass over every live record.
///
/// # Errors
///
/// Returns `AppError::Db` if the record list cannot be read. Per-agent
/// failures are reported as deferred instead.
pub async fn run_pass(ctx: &PassContext<'_>) -> Result<ReconcileReport> {
    let span = info_span!("reconcile");
    async {
        let live = ctx.agents.list_live().await?;
        let mut report = ReconcileReport {
            checked: live.len(),
            ..ReconcileReport::default()
        };

        let verdicts = join_all(live.iter().map(|record| check_one(ctx, record))).await;
        for (record, verdict) in live.iter().zip(verdicts) {
            match verdict {
                Verdict::Alive => report.alive += 1,
                Verdict::Moved(transition) => report.transitions.push(transition),
                Verdict::Unchanged => {}
                Verdict::Deferred(reason) => report.deferred.push((record.id.clone(), reason)),
            }
        }

        info!(
            checked = report.checked,
            alive = report.alive,
            changed = report.transitions.len(),
            deferred = report.deferred.len(),
            "reconcile pass complete"
        );
        Ok(report)
    }
    .instrument(span)
    .await
}

/// Reconcile a single agent, if it is live.
///
/// # Errors
///
/// Returns `AppError::NotFound` if the record does not exist.
pub async fn run_one(ctx: &PassContext<'_>, agent_id: &str) -> Result<Option<Transition>> {
    let record = ctx.agents.get_required(agent_id).await?;
    if !record.status.is_live() {
        return Ok(None);
    }
    Ok(match check_one(ctx, &record).await {
        Verdict::Moved(transition) => Some(transition),
        Verdict::Alive | Verdict::Unchanged | Verdict::Deferred(_) => None,
    })
}

async fn check_one(ctx: &PassContext<'_>, record: &AgentRecord) -> Verdict {
    let _guard = ctx.locks.lock(&record.id).await;
    match check_locked(ctx, record).await {
        Ok(verdict) => verdict,
        Err(err) => {
            warn!(agent_id = %record.id, %err, "reconcile step failed");
            Verdict::Deferred(err.to_string())
        }
    }
}

async fn check_locked(ctx: &PassContext<'_>, record: &AgentRecord) -> Result<Verdict> {
    let Some(handle) = record.handle() else {
        return settle_handleless(ctx, record).await;
    };

    let backend = ctx.registry.get(record.backend_kind)?;
    let probed = tokio::time::timeout(ctx.timeouts.probe(), backend.probe(handle)).await;
    let liveness = match probed {
        Err(_) => {
            return Ok(Verdict::Deferred(format!(
                "probe of {handle} exceeded {}s",
                ctx.timeouts.probe_seconds
            )))
        }
        Ok(Err(err @ (AppError::ProbeTimeout(_) | AppError::BackendUnavailable(_)))) => {
            return Ok(Verdict::Deferred(err.to_string()));
        }
        Ok(Err(err)) => return Err(err),
        Ok(Ok(liveness)) => liveness,
    };

    if liveness == Liveness::Alive {
        ctx.agents.touch_seen(&record.id, handle).await?;
        return Ok(Verdict::Alive);
    }

    let (to, reason) = if record.stop_requested {
        (AgentStatus::Stopped, "instance exited after stop request".to_owned())
    } else {
        (
            AgentStatus::Error,
            format!("{} instance {handle} exited unexpectedly", record.backend_kind),
        )
    };
    let message = (to == AgentStatus::Error).then_some(reason.as_str());
    if !ctx
        .agents
        .resolve_gone(&record.id, handle, to, message)
        .await?
    {
        return Ok(Verdict::Unchanged);
    }
    Ok(Verdict::Moved(
        record_transition(ctx, record, to, reason).await,
    ))
}

/// A live record without a handle: an in-flight or interrupted spawn, or
/// a `running` record that lost its handle.
async fn settle_handleless(ctx: &PassContext<'_>, record: &AgentRecord) -> Result<Verdict> {
    let age = Utc::now() - record.updated_at;
    let (reason, expected) = match record.status {
        AgentStatus::Running => (
            "running without a backend handle".to_owned(),
            AgentStatus::Running,
        ),
        AgentStatus::Spawning if age > ctx.timeouts.spawn_deadline() => (
            format!(
                "spawn interrupted: no instance after {}s",
                ctx.timeouts.spawn_deadline_seconds
            ),
            AgentStatus::Spawning,
        ),
        _ => return Ok(Verdict::Unchanged),
    };

    let to = if record.stop_requested {
        AgentStatus::Stopped
    } else {
        AgentStatus::Error
    };
    let message = (to == AgentStatus::Error).then_some(reason.as_str());
    let applied = if expected == AgentStatus::Spawning {
        // Keyed on the observed `updated_at`: a heartbeat since the read
        // means the spawn is alive.
        ctx.agents
            .expire_spawn(&record.id, record.updated_at, to, message)
            .await?
    } else if to == AgentStatus::Stopped {
        ctx.agents.mark_stopped(&record.id, &[expected]).await?
    } else {
        ctx.agents.mark_error(&record.id, &[expected], &reason).await?
    };
    if !applied {
        return Ok(Verdict::Unchanged);
    }
    Ok(Verdict::Moved(
        record_transition(ctx, record, to, reason).await,
    ))
}

async fn record_transition(
    ctx: &PassContext<'_>,
    record: &AgentRecord,
    to: AgentStatus,
    reason: String,
) -> Transition {
    info!(agent_id = %record.id, from = %record.status, %to, %reason, "reconciled");
    let line = format!("reconcile: {} -> {to}: {reason}", record.status);
    if let Err(err) = ctx.output.append(&record.id, OutputKind::System, &line).await {
        warn!(agent_id = %record.id, %err, "failed to log transition");
    }
    Transition {
        agent_id: record.id.clone(),
        from: record.status,
        to,
        reason,
    }
}

/// Spawn the periodic reconciliation task used by `am watch`.
///
/// Runs a pass immediately and then every `interval` until cancelled.
#[must_use]
pub fn spawn_reconcile_task(
    manager: Arc<AgentManager>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("reconcile task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match manager.reconcile().await {
                        Ok(report) if report.changed() => {
                            for t in &report.transitions {
                                info!(agent_id = %t.agent_id, from = %t.from, to = %t.to, "watch: status changed");
                            }
                        }
                        Ok(_) => {}
                        Err(err) => error!(%err, "reconcile pass failed"),
                    }
                }
            }
        }
    })
}
