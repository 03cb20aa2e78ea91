//! Agent lifecycle manager.
//!
//! The only component that writes agent status outside reconciliation.
//! Every operation on one agent holds that agent's in-process lock and
//! commits its transitions as compare-and-set updates, so concurrent
//! invocations (in this process or another) cannot double-start or
//! clobber each other.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};

use super::cleanup::{self, CleanOutcome, SweepOptions, SweepReport};
use super::locks::AgentLocks;
use super::reconcile::{self, PassContext, ReconcileReport, Transition};
use crate::backend::{BackendRegistry, ExecutionBackend};
use crate::bridge::capture::OutputCapture;
use crate::bridge::{SessionBridge, TerminalLease};
use crate::config::GlobalConfig;
use crate::models::agent::{
    generate_agent_id, validate_agent_id, validate_repo_url, AgentConfig, AgentFilter,
    AgentRecord, AgentStatus, BackendKind,
};
use crate::models::output::{OutputKind, OutputLine};
use crate::persistence::agent_repo::AgentRepo;
use crate::persistence::db::{self, Database};
use crate::persistence::output_repo::OutputRepo;
use crate::provision::{agent_branch, GitProvisioner, RepoProvisioner};
use crate::{AppError, Result};

/// Parameters of a spawn.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Repository to provision the working copy from.
    pub repo_url: String,
    /// Substrate to run on.
    pub backend_kind: BackendKind,
    /// Explicit id; generated when `None`.
    pub agent_id: Option<String>,
    /// Per-agent overrides.
    pub config: AgentConfig,
}

impl SpawnRequest {
    /// Request with a generated id and default overrides.
    #[must_use]
    pub fn new(repo_url: impl Into<String>, backend_kind: BackendKind) -> Self {
        Self {
            repo_url: repo_url.into(),
            backend_kind,
            agent_id: None,
            config: AgentConfig::default(),
        }
    }
}

/// What `stop` left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// The record remains, now `stopped` (or already terminal).
    Stopped(AgentRecord),
    /// The workdir and record were removed as well.
    Removed,
}

/// Orchestrates spawn, attach, stop, delete, clean, respawn and
/// reconciliation over the store and the registered backends.
pub struct AgentManager {
    config: GlobalConfig,
    agents: AgentRepo,
    output: OutputRepo,
    registry: BackendRegistry,
    provisioner: Arc<dyn RepoProvisioner>,
    locks: AgentLocks,
    lease: TerminalLease,
}

impl AgentManager {
    /// Assemble a manager from its parts.
    #[must_use]
    pub fn new(
        config: GlobalConfig,
        db: Arc<Database>,
        registry: BackendRegistry,
        provisioner: Arc<dyn RepoProvisioner>,
    ) -> Self {
        Self {
            config,
            agents: AgentRepo::new(Arc::clone(&db)),
            output: OutputRepo::new(db),
            registry,
            provisioner,
            locks: AgentLocks::new(),
            lease: TerminalLease::new(),
        }
    }

    /// Open the on-disk store and wire the real tmux, docker and git
    /// collaborators.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database cannot be opened.
    pub async fn open(config: GlobalConfig) -> Result<Self> {
        let db = Arc::new(db::connect(&config.db_path()).await?);
        let registry = BackendRegistry::from_config(&config);
        let provisioner = Arc::new(GitProvisioner::new(config.timeouts.create()));
        Ok(Self::new(config, db, registry, provisioner))
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    /// Agent record repository.
    #[must_use]
    pub fn agents(&self) -> &AgentRepo {
        &self.agents
    }

    /// Terminal lease shared by every bridge this manager opens.
    #[must_use]
    pub fn lease(&self) -> &TerminalLease {
        &self.lease
    }

    fn pass_context(&self) -> PassContext<'_> {
        PassContext {
            agents: &self.agents,
            output: &self.output,
            registry: &self.registry,
            locks: &self.locks,
            timeouts: &self.config.timeouts,
        }
    }

    async fn log_event(&self, agent_id: &str, line: &str) {
        if let Err(err) = self.output.append(agent_id, OutputKind::System, line).await {
            warn!(agent_id, %err, "failed to record lifecycle event");
        }
    }

    /// Create a new agent: provision its working copy, start a backend
    /// instance, and record it as `running`.
    ///
    /// # Errors
    ///
    /// - `AppError::Config` for an invalid explicit id.
    /// - `AppError::Conflict` if the id exists or was used before, or a stop
    ///   was requested while the instance was being created.
    /// - `AppError::CreateFailed`, `AppError::BackendUnavailable` or
    ///   `AppError::ImageBuildFailed` from provisioning or the backend; the
    ///   record is left in `error`.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<AgentRecord> {
        validate_repo_url(&request.repo_url)?;
        let agent_id = match request.agent_id {
            Some(id) => {
                validate_agent_id(&id)?;
                id
            }
            None => generate_agent_id(),
        };
        let backend = self.registry.get(request.backend_kind)?;

        let span = info_span!("spawn", agent_id = %agent_id, backend = %request.backend_kind);
        async {
            let _guard = self.locks.lock(&agent_id).await;

            let workdir = self.config.agent_workdir(&agent_id);
            let record = AgentRecord::new(
                agent_id.clone(),
                request.repo_url.clone(),
                workdir.clone(),
                request.backend_kind,
                request.config.clone(),
            );
            self.agents.insert(&record).await?;
            self.log_event(&agent_id, &format!("spawning from {}", request.repo_url))
                .await;

            if workdir.exists() {
                let err = AppError::CreateFailed(format!(
                    "working copy {} already exists",
                    workdir.display()
                ));
                return Err(self.fail_spawn(&agent_id, err).await);
            }
            let provisioned = self
                .with_spawn_heartbeat(
                    &agent_id,
                    self.provisioner.provision(
                        &request.repo_url,
                        &workdir,
                        &agent_branch(&agent_id),
                    ),
                )
                .await;
            if let Err(err) = provisioned {
                if let Err(cleanup) = cleanup::remove_workdir(&workdir).await {
                    warn!(%cleanup, "failed to remove partial working copy");
                }
                return Err(self.fail_spawn(&agent_id, err).await);
            }

            self.start_instance(backend.as_ref(), &record).await
        }
        .instrument(span)
        .await
    }

    /// Create the backend instance for a `spawning` record and promote it.
    async fn start_instance(
        &self,
        backend: &dyn ExecutionBackend,
        record: &AgentRecord,
    ) -> Result<AgentRecord> {
        let created = self
            .with_spawn_heartbeat(
                &record.id,
                backend.create(&record.id, &record.workdir, &record.config),
            )
            .await;
        let handle = match created {
            Ok(handle) => handle,
            Err(err) => return Err(self.fail_spawn(&record.id, err).await),
        };

        match self.agents.mark_running(&record.id, &handle).await {
            Ok(running) => {
                info!(handle = %handle, "agent running");
                self.log_event(&record.id, &format!("running as {handle}"))
                    .await;
                Ok(running)
            }
            Err(AppError::Conflict(msg)) => {
                // The record moved on while the instance was starting (stop
                // or delete from elsewhere); the instance must not outlive
                // that decision.
                warn!(handle = %handle, %msg, "discarding freshly created instance");
                cleanup::stop_instance(backend, &handle, self.config.timeouts.teardown())
                    .await?;
                self.agents
                    .mark_stopped(&record.id, &[AgentStatus::Spawning])
                    .await?;
                Err(AppError::Conflict(msg))
            }
            Err(err) => {
                if let Err(cleanup) =
                    cleanup::stop_instance(backend, &handle, self.config.timeouts.teardown())
                        .await
                {
                    warn!(%cleanup, handle = %handle, "failed to discard instance");
                }
                Err(err)
            }
        }
    }

    /// Drive one spawn step while refreshing the record's `updated_at`, so
    /// reconciliation elsewhere only expires spawns whose owner is gone.
    async fn with_spawn_heartbeat<T>(
        &self,
        agent_id: &str,
        step: impl Future<Output = T>,
    ) -> T {
        self.heartbeat(agent_id).await;
        let period = self.config.timeouts.spawn_heartbeat();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        tokio::pin!(step);
        loop {
            tokio::select! {
                out = &mut step => return out,
                _ = ticker.tick() => self.heartbeat(agent_id).await,
            }
        }
    }

    async fn heartbeat(&self, agent_id: &str) {
        if let Err(err) = self.agents.heartbeat_spawn(agent_id).await {
            warn!(agent_id, %err, "failed to refresh spawning record");
        }
    }

    async fn fail_spawn(&self, agent_id: &str, err: AppError) -> AppError {
        warn!(%err, "spawn failed");
        let message = err.to_string();
        match self
            .agents
            .mark_error(agent_id, &[AgentStatus::Spawning], &message)
            .await
        {
            Ok(_) => self.log_event(agent_id, &format!("spawn failed: {message}")).await,
            Err(db_err) => warn!(%db_err, "failed to record spawn failure"),
        }
        err
    }

    /// List agents matching `filter`, newest first.
    ///
    /// With `refresh`, a reconciliation pass runs first so the listing
    /// reflects the substrate.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store cannot be read.
    pub async fn list(&self, filter: &AgentFilter, refresh: bool) -> Result<Vec<AgentRecord>> {
        if refresh {
            self.reconcile().await?;
        }
        self.agents.list_where(filter).await
    }

    /// Fetch one agent, optionally reconciling it first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the agent does not exist.
    pub async fn get(&self, agent_id: &str, refresh: bool) -> Result<AgentRecord> {
        if refresh {
            reconcile::run_one(&self.pass_context(), agent_id).await?;
        }
        self.agents.get_required(agent_id).await
    }

    /// Open a bridge to a running agent's terminal.
    ///
    /// Fails without changing any state; a vanished instance is left for
    /// reconciliation to record.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` if the agent does not exist.
    /// - `AppError::NotRunning` if it has no live instance.
    /// - `AppError::AlreadyAttached` if this process already bridges the
    ///   terminal.
    pub async fn attach(&self, agent_id: &str) -> Result<SessionBridge> {
        let record = self.agents.get_required(agent_id).await?;
        let handle = match (record.status, record.handle()) {
            (AgentStatus::Running, Some(handle)) => handle.to_owned(),
            (status, _) => {
                return Err(AppError::NotRunning(format!(
                    "agent {agent_id} is {status}"
                )));
            }
        };

        let lease = self.lease.acquire(agent_id)?;
        let detach_byte = self.config.bridge.detach_byte()?;
        let backend = self.registry.get(record.backend_kind)?;
        let stream = backend.attach(&handle).await?;

        let capture = self
            .config
            .bridge
            .capture_output
            .then(|| OutputCapture::spawn(self.output.clone(), agent_id.to_owned()));
        self.log_event(agent_id, "attached").await;
        info!(agent_id, handle = %handle, "attached");
        Ok(SessionBridge::new(
            agent_id.to_owned(),
            stream,
            detach_byte,
            capture,
            lease,
        ))
    }

    /// Stop an agent gracefully.
    ///
    /// With `keep_workdir` the record stays as `stopped`; otherwise the
    /// working copy and the record are removed too.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the agent does not exist, or the
    /// substrate error if its instance cannot be stopped.
    pub async fn stop(&self, agent_id: &str, keep_workdir: bool) -> Result<StopOutcome> {
        let span = info_span!("stop", agent_id, keep_workdir);
        let outcome = async {
            let _guard = self.locks.lock(agent_id).await;
            let record = self.agents.get_required(agent_id).await?;

            if record.status.is_live() {
                self.agents.request_stop(agent_id).await?;
                if let Some(handle) = record.handle() {
                    let backend = self.registry.get(record.backend_kind)?;
                    cleanup::stop_instance(
                        backend.as_ref(),
                        handle,
                        self.config.timeouts.teardown(),
                    )
                    .await?;
                }
                self.agents
                    .mark_stopped(agent_id, &[AgentStatus::Spawning, AgentStatus::Running])
                    .await?;
                self.log_event(agent_id, "stopped").await;
                info!("agent stopped");
            }

            if keep_workdir {
                return Ok(StopOutcome::Stopped(self.agents.get_required(agent_id).await?));
            }
            let stopped = self.agents.get_required(agent_id).await?;
            cleanup::teardown_agent(
                &self.agents,
                &self.registry,
                &stopped,
                self.config.timeouts.teardown(),
            )
            .await?;
            Ok(StopOutcome::Removed)
        }
        .instrument(span)
        .await;

        if matches!(outcome, Ok(StopOutcome::Removed)) {
            self.locks.forget(agent_id).await;
        }
        outcome
    }

    /// Fully remove an agent: instance, working copy, record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the agent does not exist, or the
    /// first failing teardown step's error (the record is kept then).
    pub async fn delete(&self, agent_id: &str) -> Result<()> {
        {
            let _guard = self.locks.lock(agent_id).await;
            let record = self.agents.get_required(agent_id).await?;
            cleanup::teardown_agent(
                &self.agents,
                &self.registry,
                &record,
                self.config.timeouts.teardown(),
            )
            .await?;
        }
        self.locks.forget(agent_id).await;
        Ok(())
    }

    /// Tear down every agent matching `filter`, in parallel.
    ///
    /// Never stops early: each agent's outcome is reported individually.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` only if the initial listing fails.
    pub async fn clean(&self, filter: &AgentFilter) -> Result<Vec<CleanOutcome>> {
        let targets = self.agents.list_where(filter).await?;
        info!(count = targets.len(), "cleaning agents");

        let outcomes = join_all(targets.iter().map(|record| async move {
            let result = self.clean_one(&record.id, filter).await;
            if let Err(err) = &result {
                warn!(agent_id = %record.id, %err, "clean failed");
            }
            CleanOutcome {
                agent_id: record.id.clone(),
                error: result.err().map(|e| e.to_string()),
            }
        }))
        .await;
        Ok(outcomes)
    }

    async fn clean_one(&self, agent_id: &str, filter: &AgentFilter) -> Result<()> {
        {
            let _guard = self.locks.lock(agent_id).await;
            let Some(record) = self.agents.get(agent_id).await? else {
                return Ok(());
            };
            // Re-check under the lock: the agent may have moved out of the
            // selection since it was listed.
            if !filter.matches(&record) {
                return Err(AppError::Conflict(format!(
                    "agent {agent_id} changed to {} before it could be cleaned",
                    record.status
                )));
            }
            cleanup::teardown_agent(
                &self.agents,
                &self.registry,
                &record,
                self.config.timeouts.teardown(),
            )
            .await?;
        }
        self.locks.forget(agent_id).await;
        Ok(())
    }

    /// Start a fresh instance for a `stopped` or `error` agent on its
    /// existing working copy.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` if the agent does not exist.
    /// - `AppError::Conflict` if it is not `stopped`/`error`.
    /// - Backend errors as for [`spawn`](Self::spawn).
    pub async fn respawn(&self, agent_id: &str) -> Result<AgentRecord> {
        let span = info_span!("respawn", agent_id);
        async {
            let _guard = self.locks.lock(agent_id).await;
            let existing = self.agents.get_required(agent_id).await?;
            let backend = self.registry.get(existing.backend_kind)?;
            let record = self.agents.begin_respawn(agent_id).await?;
            self.log_event(agent_id, "respawning").await;

            if !record.workdir.is_dir() {
                let err = AppError::CreateFailed(format!(
                    "working copy {} is missing",
                    record.workdir.display()
                ));
                return Err(self.fail_spawn(agent_id, err).await);
            }
            self.start_instance(backend.as_ref(), &record).await
        }
        .instrument(span)
        .await
    }

    /// Captured output of an agent, the last `limit` lines when given.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the agent does not exist.
    pub async fn logs(&self, agent_id: &str, limit: Option<u32>) -> Result<Vec<OutputLine>> {
        self.agents.get_required(agent_id).await?;
        self.output.list(agent_id, limit).await
    }

    /// Run one reconciliation pass over all live agents.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store cannot be read.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        reconcile::run_pass(&self.pass_context()).await
    }

    /// Reconcile one agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the agent does not exist.
    pub async fn reconcile_one(&self, agent_id: &str) -> Result<Option<Transition>> {
        reconcile::run_one(&self.pass_context(), agent_id).await
    }

    /// Destroy substrate instances with no live record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store cannot be read.
    pub async fn sweep(&self, options: &SweepOptions) -> Result<SweepReport> {
        cleanup::sweep_orphans(
            &self.agents,
            &self.registry,
            &self.locks,
            options,
            self.config.timeouts.teardown(),
        )
        .await
    }
}
