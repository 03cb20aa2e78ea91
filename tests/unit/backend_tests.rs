use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agent_manager::backend::command::{self, run_bounded};
use agent_manager::backend::container::{
    exec_args, is_daemon_down, is_missing_container, parse_container_list, run_args,
    ContainerBackend,
};
use agent_manager::backend::pty::TermSize;
use agent_manager::backend::session::{
    attach_session_args, has_session_args, is_missing_session, kill_session_args,
    new_session_args, pane_pid_args, parse_session_list, SessionBackend,
};
use agent_manager::backend::{
    agent_id_from_name, BackendRegistry, ExecutionBackend, InstanceInventory, InstanceRef,
    Liveness,
};
use agent_manager::config::{
    AgentCommandConfig, ContainerConfig, GlobalConfig, SessionConfig, TimeoutConfig,
};
use agent_manager::models::agent::{AgentConfig, BackendKind};
use agent_manager::AppError;

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| (*p).to_owned()).collect()
}

fn fast_timeouts() -> TimeoutConfig {
    TimeoutConfig {
        probe_seconds: 1,
        create_seconds: 2,
        terminate_grace_seconds: 1,
        spawn_deadline_seconds: 10,
    }
}

/// Write an executable shell script standing in for tmux or docker.
#[cfg(unix)]
fn fake_bin(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    path
}

fn session_backend(tmux_bin: &str) -> SessionBackend {
    SessionBackend::new(
        AgentCommandConfig::default(),
        SessionConfig {
            tmux_bin: tmux_bin.into(),
            ..SessionConfig::default()
        },
        fast_timeouts(),
    )
}

fn container_backend(docker_bin: &str) -> ContainerBackend {
    ContainerBackend::new(
        AgentCommandConfig::default(),
        ContainerConfig {
            docker_bin: docker_bin.into(),
            ..ContainerConfig::default()
        },
        fast_timeouts(),
    )
}

// ── naming ────────────────────────────────────────────────

#[test]
fn instance_names_carry_prefix() {
    assert_eq!(session_backend("tmux").session_name("a1"), "agent-a1");
    assert_eq!(container_backend("docker").container_name("a1"), "agent-a1");
    assert_eq!(agent_id_from_name("agent-", "agent-a1"), Some("a1"));
    assert_eq!(agent_id_from_name("agent-", "agent-"), None);
    assert_eq!(agent_id_from_name("agent-", "other-a1"), None);
}

// ── tmux arguments and parsing ────────────────────────────

#[test]
fn new_session_runs_command_in_workdir() {
    let agent = AgentCommandConfig {
        command: "claude".into(),
    };
    let session = SessionConfig {
        command_args: strings(&["--verbose"]),
        ..SessionConfig::default()
    };
    let mut config = AgentConfig::default();
    config.env.insert("FOO".into(), "bar".into());

    let args = new_session_args("agent-a1", Path::new("/w/a1"), &agent, &session, &config);
    assert_eq!(
        args,
        strings(&[
            "new-session", "-d", "-s", "agent-a1", "-c", "/w/a1", "-e", "FOO=bar", "--",
            "claude", "--verbose",
        ])
    );
}

#[test]
fn per_agent_command_args_replace_defaults() {
    let session = SessionConfig {
        command_args: strings(&["--verbose"]),
        ..SessionConfig::default()
    };
    let config = AgentConfig {
        command_args: Some(strings(&["--resume"])),
        ..AgentConfig::default()
    };
    let args = new_session_args(
        "agent-a1",
        Path::new("/w"),
        &AgentCommandConfig::default(),
        &session,
        &config,
    );
    assert_eq!(args.last().map(String::as_str), Some("--resume"));
    assert!(!args.contains(&"--verbose".to_owned()));
}

#[test]
fn tmux_targets_are_exact_match() {
    assert_eq!(has_session_args("agent-a1"), strings(&["has-session", "-t", "=agent-a1"]));
    assert_eq!(kill_session_args("agent-a1"), strings(&["kill-session", "-t", "=agent-a1"]));
    assert_eq!(
        attach_session_args("agent-a1"),
        strings(&["attach-session", "-t", "=agent-a1"])
    );
    assert_eq!(
        pane_pid_args("agent-a1"),
        strings(&["display-message", "-p", "-t", "=agent-a1:", "#{pane_pid}"])
    );
}

#[test]
fn tmux_absence_messages() {
    assert!(is_missing_session("can't find session: agent-a1"));
    assert!(is_missing_session("no server running on /tmp/tmux-0/default"));
    assert!(is_missing_session("error connecting to /tmp/tmux-1000/default (No such file or directory)"));
    assert!(!is_missing_session("unknown option -- z"));
}

#[test]
fn session_list_keeps_prefixed_names() {
    let found = parse_session_list("agent-", "agent-a1\nscratch\n agent-b2 \nagent-\n");
    assert_eq!(
        found,
        vec![
            InstanceRef {
                agent_id: "a1".into(),
                handle: "agent-a1".into()
            },
            InstanceRef {
                agent_id: "b2".into(),
                handle: "agent-b2".into()
            },
        ]
    );
}

// ── docker arguments and parsing ──────────────────────────

#[test]
fn run_args_apply_limits_and_overrides() {
    let container = ContainerConfig::default();
    let mut config = AgentConfig {
        network: Some("bridge".into()),
        memory: Some("8g".into()),
        ..AgentConfig::default()
    };
    config.env.insert("MODE".into(), "ci".into());

    let args = run_args(
        "agent-a1",
        Path::new("/w/a1"),
        &container,
        &config,
        &["ANTHROPIC_API_KEY"],
    );

    let joined = args.join(" ");
    assert!(joined.starts_with("run -d --name agent-a1 --network bridge -v /w/a1:/workspace -w /workspace"));
    assert!(joined.contains("--init --rm"));
    assert!(joined.contains("--memory 8g"));
    assert!(joined.contains("--cpus 2"));
    assert!(joined.contains("--pids-limit 100"));
    assert!(joined.contains("-e ANTHROPIC_API_KEY -e MODE=ci"));
    assert!(joined.ends_with("claude-agent:latest sleep infinity"));
}

#[test]
fn run_args_default_to_isolated_network() {
    let args = run_args(
        "agent-a1",
        Path::new("/w"),
        &ContainerConfig::default(),
        &AgentConfig::default(),
        &[],
    );
    let at = args.iter().position(|a| a == "--network").expect("network flag");
    assert_eq!(args[at + 1], "none");
    assert!(!args.contains(&"-e".to_owned()));
}

#[test]
fn exec_args_launch_command_in_mount() {
    let args = exec_args(
        "abc123",
        &AgentCommandConfig::default(),
        &ContainerConfig::default(),
        &AgentConfig::default(),
        &["ANTHROPIC_API_KEY"],
    );
    assert_eq!(
        args,
        strings(&[
            "exec", "-d", "-w", "/workspace", "-e", "ANTHROPIC_API_KEY", "abc123", "claude",
            "--dangerously-skip-permissions",
        ])
    );
}

#[test]
fn docker_error_classification() {
    assert!(is_missing_container("Error: No such container: agent-a1"));
    assert!(is_missing_container("Error: No such object: abc"));
    assert!(!is_missing_container("permission denied"));
    assert!(is_daemon_down(
        "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?"
    ));
    assert!(!is_daemon_down("No such container: x"));
}

#[test]
fn container_list_maps_names_to_ids() {
    let found = parse_container_list("agent-", "abc123 agent-a1\ndef456 postgres\n\nfff000 agent-b2\n");
    assert_eq!(
        found,
        vec![
            InstanceRef {
                agent_id: "a1".into(),
                handle: "abc123".into()
            },
            InstanceRef {
                agent_id: "b2".into(),
                handle: "fff000".into()
            },
        ]
    );
}

// ── terminal size ─────────────────────────────────────────

#[test]
fn stty_size_parsing() {
    assert_eq!(TermSize::parse_stty("50 200\n"), Some(TermSize { rows: 50, cols: 200 }));
    assert_eq!(TermSize::parse_stty("0 80"), None);
    assert_eq!(TermSize::parse_stty("garbage"), None);
    assert_eq!(TermSize::parse_stty(""), None);
    assert_eq!(TermSize::default(), TermSize { rows: 24, cols: 80 });
}

#[tokio::test]
async fn terminal_size_detection_runs_on_the_runtime() {
    let size = tokio::time::timeout(Duration::from_secs(5), TermSize::detect())
        .await
        .expect("detect finishes");
    assert!(size.rows > 0 && size.cols > 0);
}

// ── registry ──────────────────────────────────────────────

#[test]
fn empty_registry_reports_unavailable() {
    let registry = BackendRegistry::new();
    assert!(matches!(
        registry.get(BackendKind::Session),
        Err(AppError::BackendUnavailable(_))
    ));
    assert!(registry.inventories().is_empty());
}

#[test]
fn configured_registry_has_both_kinds() {
    let registry = BackendRegistry::from_config(&GlobalConfig::default());
    assert!(registry.get(BackendKind::Session).is_ok());
    assert!(registry.get(BackendKind::Container).is_ok());
    let kinds: Vec<_> = registry.inventories().into_iter().map(|(k, _, _)| k).collect();
    assert_eq!(kinds, vec![BackendKind::Container, BackendKind::Session]);
}

#[test]
fn registration_without_inventory_is_not_swept() {
    let backend = Arc::new(session_backend("tmux"));
    let registry = BackendRegistry::new().with_backend(BackendKind::Session, backend, None);
    assert!(registry.get(BackendKind::Session).is_ok());
    assert!(registry.inventories().is_empty());
}

// ── command runner ────────────────────────────────────────

#[tokio::test]
async fn missing_binary_is_backend_unavailable() {
    let result = run_bounded("/nonexistent/bin/tmux", &[], Duration::from_secs(1)).await;
    assert!(matches!(result, Err(AppError::BackendUnavailable(_))));
}

#[cfg(unix)]
#[tokio::test]
async fn slow_command_times_out() {
    let result = run_bounded("sh", &command::args(["-c", "sleep 5"]), Duration::from_millis(100))
        .await
        .expect("started");
    assert!(result.is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn command_output_is_trimmed() {
    let out = run_bounded(
        "sh",
        &command::args(["-c", "echo '  hi  '; echo oops >&2; exit 3"]),
        Duration::from_secs(5),
    )
    .await
    .expect("started")
    .expect("finished");
    assert!(!out.success);
    assert_eq!(out.stdout, "hi");
    assert_eq!(out.stderr, "oops");
}

// ── session backend against a fake tmux ───────────────────

#[tokio::test]
async fn session_probe_without_tmux_is_unavailable() {
    let backend = session_backend("/nonexistent/bin/tmux");
    assert!(matches!(
        backend.probe("agent-a1").await,
        Err(AppError::BackendUnavailable(_))
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn session_probe_follows_has_session_status() {
    let dir = tempfile::tempdir().expect("tempdir");
    let alive = fake_bin(dir.path(), "tmux-alive", "exit 0");
    let gone = fake_bin(dir.path(), "tmux-gone", "echo \"can't find session\" >&2; exit 1");

    let backend = session_backend(&alive.to_string_lossy());
    assert_eq!(backend.probe("agent-a1").await.expect("probe"), Liveness::Alive);

    let backend = session_backend(&gone.to_string_lossy());
    assert_eq!(backend.probe("agent-a1").await.expect("probe"), Liveness::Gone);
    assert!(matches!(
        backend.attach("agent-a1").await,
        Err(AppError::NotRunning(_))
    ));
    backend.destroy("agent-a1").await.expect("destroy of missing session");
    backend.terminate("agent-a1").await.expect("terminate of missing session");
}

#[cfg(unix)]
#[tokio::test]
async fn terminating_gone_session_leaves_prefixed_sibling_alone() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut sibling = std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("spawn sibling pane process");

    // Only a loose target resolves to the sibling `agent-ab` pane.
    let script = format!(
        r#"case "$*" in
  "display-message -p -t =agent-a: #{{pane_pid}}") echo "can't find session: agent-a" >&2; exit 1;;
  display-message*) echo {pid}; exit 0;;
  *) echo "can't find session" >&2; exit 1;;
esac"#,
        pid = sibling.id()
    );
    let tmux = fake_bin(dir.path(), "tmux", &script);
    let backend = session_backend(&tmux.to_string_lossy());

    backend
        .terminate("agent-a")
        .await
        .expect("terminate of missing session");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let status = sibling.try_wait().expect("try_wait");
    sibling.kill().ok();
    sibling.wait().ok();
    assert!(status.is_none(), "sibling pane process was signalled: {status:?}");
}

#[cfg(unix)]
#[tokio::test]
async fn session_probe_timeout_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let hung = fake_bin(dir.path(), "tmux-hung", "sleep 5");
    let backend = session_backend(&hung.to_string_lossy());
    assert!(matches!(
        backend.probe("agent-a1").await,
        Err(AppError::ProbeTimeout(_))
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn session_create_refuses_existing_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tmux = fake_bin(dir.path(), "tmux", "exit 0");
    let backend = session_backend(&tmux.to_string_lossy());
    let result = backend
        .create("a1", dir.path(), &AgentConfig::default())
        .await;
    assert!(matches!(result, Err(AppError::CreateFailed(msg)) if msg.contains("already exists")));
}

#[cfg(unix)]
#[tokio::test]
async fn session_inventory_with_no_server_is_empty() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tmux = fake_bin(
        dir.path(),
        "tmux",
        "echo 'no server running on /tmp/tmux-0/default' >&2; exit 1",
    );
    let backend = session_backend(&tmux.to_string_lossy());
    assert!(backend.list_instances().await.expect("list").is_empty());
}

// ── container backend against a fake docker ───────────────

#[cfg(unix)]
#[tokio::test]
async fn container_probe_reads_running_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let docker = fake_bin(
        dir.path(),
        "docker",
        r#"case "$4" in
  live) echo true ;;
  exited) echo false ;;
  *) echo "Error: No such object: $4" >&2; exit 1 ;;
esac"#,
    );
    let backend = container_backend(&docker.to_string_lossy());
    assert_eq!(backend.probe("live").await.expect("probe"), Liveness::Alive);
    assert_eq!(backend.probe("exited").await.expect("probe"), Liveness::Gone);
    assert_eq!(backend.probe("missing").await.expect("probe"), Liveness::Gone);
}

#[cfg(unix)]
#[tokio::test]
async fn container_create_fails_fast_when_daemon_down() {
    let dir = tempfile::tempdir().expect("tempdir");
    let docker = fake_bin(
        dir.path(),
        "docker",
        "echo 'Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?' >&2; exit 1",
    );
    let backend = container_backend(&docker.to_string_lossy());
    let result = backend.create("a1", dir.path(), &AgentConfig::default()).await;
    assert!(matches!(result, Err(AppError::BackendUnavailable(_))));
    assert!(matches!(
        backend.probe("abc").await,
        Err(AppError::BackendUnavailable(_))
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn missing_image_without_build_context_fails_build() {
    let dir = tempfile::tempdir().expect("tempdir");
    let docker = fake_bin(
        dir.path(),
        "docker",
        r#"case "$1" in
  info) echo 24.0.0 ;;
  *) echo "Error: No such image" >&2; exit 1 ;;
esac"#,
    );
    let backend = container_backend(&docker.to_string_lossy());
    let result = backend.create("a1", dir.path(), &AgentConfig::default()).await;
    assert!(matches!(result, Err(AppError::ImageBuildFailed(_))));
}

#[cfg(unix)]
#[tokio::test]
async fn run_without_container_id_removes_named_container() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("calls.log");
    let docker = fake_bin(
        dir.path(),
        "docker",
        &format!(
            r#"echo "$*" >> '{log}'
case "$1" in
  rm) echo "Error: removal of container $3 is already in progress" >&2; exit 1 ;;
  *) exit 0 ;;
esac"#,
            log = log.display()
        ),
    );
    let backend = container_backend(&docker.to_string_lossy());

    let result = backend.create("a1", dir.path(), &AgentConfig::default()).await;
    assert!(matches!(result, Err(AppError::CreateFailed(msg)) if msg.contains("no container id")));

    let calls = std::fs::read_to_string(&log).expect("call log");
    assert!(calls.lines().any(|l| l == "rm -f agent-a1"), "calls: {calls}");
}

#[cfg(unix)]
#[tokio::test]
async fn container_teardown_tolerates_missing_container() {
    let dir = tempfile::tempdir().expect("tempdir");
    let docker = fake_bin(
        dir.path(),
        "docker",
        "echo 'Error: No such container: abc' >&2; exit 1",
    );
    let backend = container_backend(&docker.to_string_lossy());
    backend.terminate("abc").await.expect("terminate");
    backend.destroy("abc").await.expect("destroy");
}

#[cfg(unix)]
#[tokio::test]
async fn container_inventory_lists_agent_containers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let docker = fake_bin(
        dir.path(),
        "docker",
        "printf 'c1 agent-a1\\nc2 agent-b2\\n'",
    );
    let backend = container_backend(&docker.to_string_lossy());
    let found = backend.list_instances().await.expect("list");
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].handle, "c1");
    assert_eq!(found[1].agent_id, "b2");
}
