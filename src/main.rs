#![forbid(unsafe_code)]

//! `am`: spawn, attach to, and supervise coding agents running in tmux
//! sessions or isolated docker containers.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_manager::backend::container::ContainerBackend;
use agent_manager::bridge::terminal::stdin_is_terminal;
use agent_manager::bridge::BridgeOutcome;
use agent_manager::models::agent::{AgentConfig, AgentFilter, AgentRecord, AgentStatus, BackendKind};
use agent_manager::orchestrator::cleanup::SweepOptions;
use agent_manager::orchestrator::reconcile::spawn_reconcile_task;
use agent_manager::orchestrator::{AgentManager, SpawnRequest, StopOutcome};
use agent_manager::{AppError, GlobalConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum BackendArg {
    Session,
    Container,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Session => Self::Session,
            BackendArg::Container => Self::Container,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "am", about = "Supervise interactive coding agents", version, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file (default: <state_dir>/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format (text or json). Logs go to stderr.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Clone a repository and start an agent on it.
    Spawn {
        /// Repository URL or local path.
        repo_url: String,
        /// Execution substrate.
        #[arg(long, value_enum, default_value_t = BackendArg::Container)]
        backend: BackendArg,
        /// Explicit agent id (generated when omitted).
        #[arg(long)]
        id: Option<String>,
        /// Container network mode override (e.g. `bridge`).
        #[arg(long)]
        network: Option<String>,
        /// Container memory ceiling override.
        #[arg(long)]
        memory: Option<String>,
        /// Container CPU ceiling override.
        #[arg(long)]
        cpus: Option<String>,
        /// Extra environment for the agent, as KEY=VALUE.
        #[arg(long = "env", value_parser = parse_key_val)]
        env: Vec<(String, String)>,
        /// Replacement arguments for the supervised command.
        #[arg(long = "arg", allow_hyphen_values = true)]
        args: Vec<String>,
        /// Attach right after the agent is running.
        #[arg(long)]
        attach: bool,
    },

    /// List agents.
    List {
        /// Only agents in this status.
        #[arg(long, value_parser = parse_status)]
        status: Option<AgentStatus>,
        /// Reconcile with the substrates first.
        #[arg(long)]
        refresh: bool,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Show one agent.
    Info {
        /// Agent id.
        id: String,
        /// Reconcile the agent first.
        #[arg(long)]
        refresh: bool,
        /// Print JSON.
        #[arg(long)]
        json: bool,
    },

    /// Bridge this terminal to a running agent.
    Attach {
        /// Agent id.
        id: String,
    },

    /// Stop an agent; removes its workdir and record unless kept.
    Stop {
        /// Agent id.
        id: String,
        /// Keep the working copy and the record.
        #[arg(long)]
        keep_workdir: bool,
    },

    /// Remove an agent completely.
    Delete {
        /// Agent id.
        id: String,
    },

    /// Remove agents in bulk (default: stopped agents).
    Clean {
        /// Status to clean.
        #[arg(long, value_parser = parse_status, conflicts_with = "all")]
        status: Option<AgentStatus>,
        /// Clean every agent regardless of status.
        #[arg(long, short = 'a')]
        all: bool,
    },

    /// Show captured output of an agent.
    Logs {
        /// Agent id.
        id: String,
        /// Only the last N lines.
        #[arg(long, short = 'n')]
        tail: Option<u32>,
    },

    /// Start a fresh instance for a stopped or failed agent.
    Respawn {
        /// Agent id.
        id: String,
    },

    /// Run one reconciliation pass.
    Reconcile {
        /// Print JSON.
        #[arg(long)]
        json: bool,
    },

    /// Reconcile periodically until interrupted.
    Watch {
        /// Seconds between passes (default from config).
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Destroy tmux sessions and containers no live agent accounts for.
    Sweep {
        /// Only list what would be destroyed.
        #[arg(long)]
        dry_run: bool,
    },

    /// Clean docker resources.
    DockerClean {
        /// Remove agent containers without a live agent.
        #[arg(long)]
        containers: bool,
        /// Remove the base image and prune dangling images.
        #[arg(long)]
        images: bool,
        /// Both of the above.
        #[arg(long, short = 'a')]
        all: bool,
    },
}

fn parse_key_val(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw}"))
}

fn parse_status(raw: &str) -> std::result::Result<AgentStatus, String> {
    raw.parse::<AgentStatus>().map_err(|_| {
        format!("unknown status {raw} (expected spawning, running, stopped or error)")
    })
}

fn main() -> ExitCode {
    let args = Cli::parse();
    if let Err(err) = init_tracing(args.log_format) {
        eprintln!("{err}");
        return exit_code(&err);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            let err = AppError::Config(format!("failed to build tokio runtime: {err}"));
            eprintln!("{err}");
            return exit_code(&err);
        }
    };

    let result = runtime.block_on(run(args));
    // A pending terminal read may still sit on a blocking thread.
    runtime.shutdown_timeout(Duration::from_millis(200));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            exit_code(&err)
        }
    }
}

fn exit_code(err: &AppError) -> ExitCode {
    ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(1))
}

async fn run(args: Cli) -> Result<()> {
    let config = GlobalConfig::load(args.config.as_deref())?;
    let manager = AgentManager::open(config).await?;

    match args.command {
        Command::Spawn {
            repo_url,
            backend,
            id,
            network,
            memory,
            cpus,
            env,
            args,
            attach,
        } => {
            let request = SpawnRequest {
                repo_url,
                backend_kind: backend.into(),
                agent_id: id,
                config: AgentConfig {
                    network,
                    memory,
                    cpus,
                    command_args: (!args.is_empty()).then_some(args),
                    env: env.into_iter().collect(),
                },
            };
            let record = manager.spawn(request).await?;
            println!("spawned {} ({})", record.id, record.backend_kind);
            println!("  workdir: {}", record.workdir.display());
            if attach {
                attach_terminal(&manager, &record.id).await?;
            } else {
                println!("attach with: am attach {}", record.id);
            }
        }
        Command::List {
            status,
            refresh,
            json,
        } => {
            let filter = status.map_or(AgentFilter::All, AgentFilter::Status);
            let agents = manager.list(&filter, refresh).await?;
            if json {
                print_json(&agents)?;
            } else {
                print_table(&agents);
            }
        }
        Command::Info { id, refresh, json } => {
            let record = manager.get(&id, refresh).await?;
            if json {
                print_json(&record)?;
            } else {
                print_record(&record);
            }
        }
        Command::Attach { id } => attach_terminal(&manager, &id).await?,
        Command::Stop { id, keep_workdir } => match manager.stop(&id, keep_workdir).await? {
            StopOutcome::Stopped(record) => {
                println!("stopped {} (workdir kept at {})", id, record.workdir.display());
            }
            StopOutcome::Removed => println!("stopped and removed {id}"),
        },
        Command::Delete { id } => {
            manager.delete(&id).await?;
            println!("deleted {id}");
        }
        Command::Clean { status, all } => {
            let filter = if all {
                AgentFilter::All
            } else {
                AgentFilter::Status(status.unwrap_or(AgentStatus::Stopped))
            };
            let outcomes = manager.clean(&filter).await?;
            let failed: Vec<_> = outcomes.iter().filter(|o| !o.is_ok()).collect();
            for outcome in &failed {
                println!(
                    "failed {}: {}",
                    outcome.agent_id,
                    outcome.error.as_deref().unwrap_or_default()
                );
            }
            println!("cleaned {} of {} agent(s)", outcomes.len() - failed.len(), outcomes.len());
            if !failed.is_empty() {
                return Err(AppError::Conflict(format!(
                    "{} agent(s) could not be cleaned",
                    failed.len()
                )));
            }
        }
        Command::Logs { id, tail } => {
            for line in manager.logs(&id, tail).await? {
                println!(
                    "{} [{}] {}",
                    line.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    line.kind.as_str(),
                    line.content
                );
            }
        }
        Command::Respawn { id } => {
            let record = manager.respawn(&id).await?;
            println!("respawned {} ({})", record.id, record.handle().unwrap_or_default());
        }
        Command::Reconcile { json } => {
            let report = manager.reconcile().await?;
            if json {
                print_json(&report)?;
            } else {
                for t in &report.transitions {
                    println!("{}: {} -> {} ({})", t.agent_id, t.from, t.to, t.reason);
                }
                for (id, reason) in &report.deferred {
                    println!("{id}: deferred ({reason})");
                }
                println!(
                    "checked {}, alive {}, changed {}",
                    report.checked,
                    report.alive,
                    report.transitions.len()
                );
            }
        }
        Command::Watch { interval } => {
            let interval = Duration::from_secs(
                interval
                    .filter(|s| *s > 0)
                    .unwrap_or(manager.config().reconcile.interval_seconds),
            );
            let cancel = CancellationToken::new();
            let manager = Arc::new(manager);
            info!(interval_secs = interval.as_secs(), "watching agents");
            let handle = spawn_reconcile_task(Arc::clone(&manager), interval, cancel.clone());
            shutdown_signal().await;
            cancel.cancel();
            if let Err(err) = handle.await {
                warn!(%err, "reconcile task ended abnormally");
            }
        }
        Command::Sweep { dry_run } => {
            let report = manager
                .sweep(&SweepOptions {
                    kinds: Vec::new(),
                    dry_run,
                })
                .await?;
            print_sweep(&report, dry_run);
        }
        Command::DockerClean {
            containers,
            images,
            all,
        } => {
            if !(containers || images || all) {
                return Err(AppError::Config(
                    "pass --containers, --images or --all".into(),
                ));
            }
            let docker = ContainerBackend::new(
                manager.config().agent.clone(),
                manager.config().container.clone(),
                manager.config().timeouts.clone(),
            );
            docker.preflight().await?;
            if containers || all {
                let report = manager
                    .sweep(&SweepOptions {
                        kinds: vec![BackendKind::Container],
                        dry_run: false,
                    })
                    .await?;
                print_sweep(&report, false);
            }
            if images || all {
                if docker.purge_images().await? {
                    println!("removed image {}", manager.config().container.image);
                } else {
                    println!("image {} not present", manager.config().container.image);
                }
            }
        }
    }
    Ok(())
}

async fn attach_terminal(manager: &AgentManager, agent_id: &str) -> Result<()> {
    let bridge = manager.attach(agent_id).await?;
    if !stdin_is_terminal() {
        warn!(agent_id, "stdin is not a terminal; relaying without raw mode");
    }
    eprintln!(
        "attached to {agent_id}; press {} to detach",
        manager.config().bridge.detach_key
    );
    match bridge.run_terminal(CancellationToken::new()).await {
        Ok(BridgeOutcome::Detached | BridgeOutcome::Cancelled) => {
            eprintln!("\r\ndetached from {agent_id} (agent keeps running)");
            Ok(())
        }
        Err(AppError::SessionEnded(msg)) => {
            eprintln!("\r\nsession ended");
            if let Err(err) = manager.reconcile_one(agent_id).await {
                warn!(%err, agent_id, "could not reconcile after session end");
            }
            Err(AppError::SessionEnded(msg))
        }
        Err(err) => Err(err),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::Io(format!("failed to encode json: {err}")))?;
    println!("{text}");
    Ok(())
}

fn print_table(agents: &[AgentRecord]) {
    if agents.is_empty() {
        println!("no agents");
        return;
    }
    println!(
        "{:<14} {:<10} {:<9} {:<20} REPO",
        "ID", "BACKEND", "STATUS", "CREATED"
    );
    for agent in agents {
        println!(
            "{:<14} {:<10} {:<9} {:<20} {}",
            agent.id,
            agent.backend_kind.as_str(),
            agent.status.as_str(),
            agent.created_at.format("%Y-%m-%d %H:%M:%S"),
            agent.repo_url
        );
    }
}

fn print_record(record: &AgentRecord) {
    println!("id:        {}", record.id);
    println!("status:    {}", record.status);
    println!("backend:   {}", record.backend_kind);
    println!("handle:    {}", record.handle().unwrap_or("-"));
    println!("repo:      {}", record.repo_url);
    println!("workdir:   {}", record.workdir.display());
    println!("created:   {}", record.created_at.to_rfc3339());
    println!(
        "last seen: {}",
        record
            .last_seen_at
            .map_or_else(|| "-".to_owned(), |t| t.to_rfc3339())
    );
    if let Some(err) = &record.last_error {
        println!("error:     {err}");
    }
}

fn print_sweep(report: &agent_manager::orchestrator::cleanup::SweepReport, dry_run: bool) {
    let verb = if dry_run { "would remove" } else { "removed" };
    for item in &report.removed {
        println!("{verb} {} {} ({})", item.kind, item.handle, item.reason);
    }
    for err in &report.errors {
        println!("error: {err}");
    }
    if report.removed.is_empty() {
        println!("no orphaned instances");
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
