use agent_manager::bridge::BridgeOutcome;
use agent_manager::models::agent::{AgentConfig, AgentFilter, AgentStatus, BackendKind};
use agent_manager::models::output::OutputKind;
use agent_manager::orchestrator::{SpawnRequest, StopOutcome};
use agent_manager::AppError;
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use super::test_helpers::{harness, request, REPO_URL};

#[tokio::test]
async fn spawn_runs_agent_in_fresh_workdir() {
    let h = harness().await;

    let record = h
        .manager
        .spawn(request("alpha", BackendKind::Session))
        .await
        .expect("spawn");

    assert_eq!(record.status, AgentStatus::Running);
    assert_eq!(record.workdir, h.agents_dir.join("alpha"));
    assert!(record.workdir.join("BRANCH").is_file());
    assert_eq!(
        std::fs::read_to_string(record.workdir.join("BRANCH")).expect("branch"),
        "agent-dev/alpha"
    );
    let handle = record.handle().expect("handle").to_owned();
    assert!(h.session.is_alive(&handle));
    assert_eq!(h.container.instance_count(), 0);

    let logs = h.manager.logs("alpha", None).await.expect("logs");
    assert!(logs.iter().all(|l| l.kind == OutputKind::System));
    assert!(logs[0].content.starts_with("spawning from"));
    assert!(logs.iter().any(|l| l.content == format!("running as {handle}")));
}

#[tokio::test]
async fn spawn_generates_id_when_absent() {
    let h = harness().await;
    let record = h
        .manager
        .spawn(SpawnRequest::new(REPO_URL, BackendKind::Container))
        .await
        .expect("spawn");

    assert_eq!(record.id.len(), 12);
    assert_eq!(record.backend_kind, BackendKind::Container);
    assert_eq!(h.container.instance_count(), 1);
}

#[tokio::test]
async fn spawn_rejects_bad_input_before_touching_anything() {
    let h = harness().await;

    let bad_id = h.manager.spawn(request("Not Valid", BackendKind::Session)).await;
    assert!(matches!(bad_id, Err(AppError::Config(_))));

    let bad_url = h
        .manager
        .spawn(SpawnRequest::new("ftp://nowhere/repo", BackendKind::Session))
        .await;
    assert!(bad_url.is_err());

    assert_eq!(h.provisioner.calls(), 0);
    assert!(h
        .manager
        .list(&AgentFilter::All, false)
        .await
        .expect("list")
        .is_empty());
}

#[tokio::test]
async fn per_agent_config_is_persisted() {
    let h = harness().await;
    let mut req = request("cfg", BackendKind::Container);
    req.config = AgentConfig {
        network: Some("bridge".into()),
        ..AgentConfig::default()
    };

    h.manager.spawn(req).await.expect("spawn");
    let record = h.manager.get("cfg", false).await.expect("get");
    assert_eq!(record.config.network.as_deref(), Some("bridge"));
}

#[tokio::test]
async fn duplicate_id_is_conflict() {
    let h = harness().await;
    h.manager
        .spawn(request("dup", BackendKind::Session))
        .await
        .expect("first spawn");

    let second = h.manager.spawn(request("dup", BackendKind::Session)).await;
    assert!(matches!(second, Err(AppError::Conflict(_))));
    assert_eq!(h.session.instance_count(), 1);
}

#[tokio::test]
async fn concurrent_spawns_of_one_id_start_one_instance() {
    let h = harness().await;

    let (a, b) = tokio::join!(
        h.manager.spawn(request("race", BackendKind::Session)),
        h.manager.spawn(request("race", BackendKind::Session)),
    );

    let oks = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(oks, 1);
    assert!(matches!(a.err().or(b.err()), Some(AppError::Conflict(_))));
    assert_eq!(h.session.created(), 1);
    assert_eq!(h.session.instance_count(), 1);
}

#[tokio::test]
async fn concurrent_spawns_of_distinct_ids_all_succeed() {
    let h = harness().await;
    let ids: Vec<String> = (0..6).map(|i| format!("par-{i}")).collect();

    let results = join_all(
        ids.iter()
            .map(|id| h.manager.spawn(request(id, BackendKind::Container))),
    )
    .await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(h.container.instance_count(), 6);
    let running = h
        .manager
        .list(&AgentFilter::Status(AgentStatus::Running), false)
        .await
        .expect("list");
    assert_eq!(running.len(), 6);
}

#[tokio::test]
async fn backend_create_failure_leaves_error_record_and_workdir() {
    let h = harness().await;
    h.session.fail_create("tmux exploded");

    let result = h.manager.spawn(request("boom", BackendKind::Session)).await;
    assert!(matches!(result, Err(AppError::CreateFailed(_))));

    let record = h.manager.get("boom", false).await.expect("record kept");
    assert_eq!(record.status, AgentStatus::Error);
    assert!(record.handle().is_none());
    assert!(record
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("tmux exploded")));
    assert!(record.workdir.is_dir());
    assert_eq!(h.session.instance_count(), 0);
}

#[tokio::test]
async fn provisioning_failure_removes_partial_workdir() {
    let h = harness().await;
    h.provisioner.set_fail(true);

    let result = h.manager.spawn(request("noclone", BackendKind::Session)).await;
    assert!(matches!(result, Err(AppError::CreateFailed(_))));

    let record = h.manager.get("noclone", false).await.expect("record kept");
    assert_eq!(record.status, AgentStatus::Error);
    assert!(!record.workdir.exists());
    assert_eq!(h.session.created(), 0);
}

#[tokio::test]
async fn existing_workdir_is_not_overwritten() {
    let h = harness().await;
    let squatter = h.agents_dir.join("taken");
    std::fs::create_dir_all(&squatter).expect("mkdir");
    std::fs::write(squatter.join("precious.txt"), "keep me").expect("write");

    let result = h.manager.spawn(request("taken", BackendKind::Session)).await;
    assert!(matches!(result, Err(AppError::CreateFailed(_))));
    assert!(squatter.join("precious.txt").is_file());
    assert_eq!(h.provisioner.calls(), 0);
}

#[tokio::test]
async fn stop_keeping_workdir_leaves_stopped_record() {
    let h = harness().await;
    let record = h
        .manager
        .spawn(request("keep", BackendKind::Session))
        .await
        .expect("spawn");
    let handle = record.handle().expect("handle").to_owned();

    let outcome = h.manager.stop("keep", true).await.expect("stop");
    let StopOutcome::Stopped(stopped) = outcome else {
        panic!("expected a kept record, got {outcome:?}");
    };

    assert_eq!(stopped.status, AgentStatus::Stopped);
    assert!(stopped.handle().is_none());
    assert!(stopped.stop_requested);
    assert!(stopped.workdir.is_dir());
    assert!(!h.session.is_alive(&handle));

    // Stopping again is harmless.
    assert!(matches!(
        h.manager.stop("keep", true).await.expect("second stop"),
        StopOutcome::Stopped(_)
    ));
}

#[tokio::test]
async fn stop_without_keep_removes_everything() {
    let h = harness().await;
    let record = h
        .manager
        .spawn(request("gone", BackendKind::Container))
        .await
        .expect("spawn");

    let outcome = h.manager.stop("gone", false).await.expect("stop");
    assert_eq!(outcome, StopOutcome::Removed);
    assert!(!record.workdir.exists());
    assert_eq!(h.container.instance_count(), 0);
    assert!(matches!(
        h.manager.get("gone", false).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn delete_removes_instance_workdir_and_record() {
    let h = harness().await;
    let record = h
        .manager
        .spawn(request("del", BackendKind::Session))
        .await
        .expect("spawn");

    h.manager.delete("del").await.expect("delete");

    assert!(!record.workdir.exists());
    assert_eq!(h.session.instance_count(), 0);
    assert!(matches!(
        h.manager.get("del", false).await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        h.manager.delete("del").await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn deleted_id_cannot_be_reused() {
    let h = harness().await;
    h.manager
        .spawn(request("once", BackendKind::Session))
        .await
        .expect("spawn");
    h.manager.delete("once").await.expect("delete");

    let again = h.manager.spawn(request("once", BackendKind::Session)).await;
    assert!(matches!(again, Err(AppError::Conflict(_))));
    assert_eq!(h.provisioner.calls(), 1);
}

#[tokio::test]
async fn respawn_starts_new_instance_on_same_workdir() {
    let h = harness().await;
    let first = h
        .manager
        .spawn(request("again", BackendKind::Session))
        .await
        .expect("spawn");
    h.manager.stop("again", true).await.expect("stop");

    let second = h.manager.respawn("again").await.expect("respawn");

    assert_eq!(second.status, AgentStatus::Running);
    assert_eq!(second.workdir, first.workdir);
    assert!(!second.stop_requested);
    assert_ne!(second.handle(), first.handle());
    assert_eq!(h.session.instance_count(), 1);
    assert_eq!(h.provisioner.calls(), 1);

    assert!(matches!(
        h.manager.respawn("again").await,
        Err(AppError::Conflict(_))
    ));
}

#[tokio::test]
async fn respawn_recovers_failed_agent_and_clears_error() {
    let h = harness().await;
    h.session.fail_create("no pty available");
    h.manager
        .spawn(request("flaky", BackendKind::Session))
        .await
        .expect_err("first create fails");
    h.session.allow_create();

    let record = h.manager.respawn("flaky").await.expect("respawn");

    assert_eq!(record.status, AgentStatus::Running);
    assert!(record.last_error.is_none());
    assert!(record.handle_consistent());
    assert_eq!(h.provisioner.calls(), 1);
}

#[tokio::test]
async fn respawn_without_workdir_fails_into_error() {
    let h = harness().await;
    let record = h
        .manager
        .spawn(request("lost", BackendKind::Session))
        .await
        .expect("spawn");
    h.manager.stop("lost", true).await.expect("stop");
    std::fs::remove_dir_all(&record.workdir).expect("rm workdir");

    let result = h.manager.respawn("lost").await;
    assert!(matches!(result, Err(AppError::CreateFailed(_))));
    assert_eq!(
        h.manager.get("lost", false).await.expect("get").status,
        AgentStatus::Error
    );
}

#[tokio::test]
async fn logs_tail_returns_latest_lines() {
    let h = harness().await;
    h.manager
        .spawn(request("chatty", BackendKind::Session))
        .await
        .expect("spawn");
    h.manager.stop("chatty", true).await.expect("stop");

    let all = h.manager.logs("chatty", None).await.expect("logs");
    let tail = h.manager.logs("chatty", Some(1)).await.expect("tail");
    assert!(all.len() >= 3);
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].content, "stopped");
    assert!(matches!(
        h.manager.logs("nobody", None).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn attach_to_stopped_agent_is_not_running_and_changes_nothing() {
    let h = harness().await;
    h.manager
        .spawn(request("idle", BackendKind::Session))
        .await
        .expect("spawn");
    h.manager.stop("idle", true).await.expect("stop");
    let before = h.manager.get("idle", false).await.expect("get");

    let result = h.manager.attach("idle").await;
    assert!(matches!(result, Err(AppError::NotRunning(_))));
    assert_eq!(h.manager.get("idle", false).await.expect("get"), before);
    assert!(!h.manager.lease().is_held());

    assert!(matches!(
        h.manager.attach("ghost").await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn attach_to_vanished_instance_leaves_record_for_reconcile() {
    let h = harness().await;
    let record = h
        .manager
        .spawn(request("vanish", BackendKind::Session))
        .await
        .expect("spawn");
    h.session
        .kill_out_of_band(record.handle().expect("handle"));

    let result = h.manager.attach("vanish").await;
    assert!(matches!(result, Err(AppError::NotRunning(_))));
    assert_eq!(
        h.manager.get("vanish", false).await.expect("get").status,
        AgentStatus::Running
    );
    assert!(!h.manager.lease().is_held());
}

#[tokio::test]
async fn bridge_detach_keeps_agent_running() {
    let h = harness().await;
    let record = h
        .manager
        .spawn(request("live", BackendKind::Container))
        .await
        .expect("spawn");

    let bridge = h.manager.attach("live").await.expect("attach");
    assert_eq!(bridge.agent_id(), "live");
    assert!(h.manager.lease().is_held());
    assert!(matches!(
        h.manager.attach("live").await,
        Err(AppError::AlreadyAttached(_))
    ));

    let outcome = bridge
        .run(&b"make test\x1d"[..], Vec::new(), CancellationToken::new())
        .await
        .expect("bridge");

    assert_eq!(outcome, BridgeOutcome::Detached);
    assert!(!h.manager.lease().is_held());
    assert!(h.container.is_alive(record.handle().expect("handle")));
    assert_eq!(
        h.manager.get("live", false).await.expect("get").status,
        AgentStatus::Running
    );
    let logs = h.manager.logs("live", None).await.expect("logs");
    assert!(logs.iter().any(|l| l.content == "attached"));
}

#[tokio::test]
async fn stop_from_another_invocation_mid_spawn_discards_new_instance() {
    let h = harness().await;
    let gate = h.session.hold_create();
    let manager = h.manager.clone();
    let spawn = tokio::spawn(async move {
        manager.spawn(request("mid", BackendKind::Session)).await
    });

    gate.entered.notified().await;
    assert!(h.other_repo().request_stop("mid").await.expect("request stop"));
    gate.release.notify_one();

    let result = spawn.await.expect("spawn task");
    assert!(matches!(result, Err(AppError::Conflict(_))));
    assert_eq!(h.session.created(), 1);
    assert_eq!(h.session.instance_count(), 0);

    let record = h.manager.get("mid", false).await.expect("get");
    assert_eq!(record.status, AgentStatus::Stopped);
    assert!(record.handle().is_none());
}

#[tokio::test]
async fn delete_from_another_invocation_mid_spawn_discards_new_instance() {
    let h = harness().await;
    let gate = h.container.hold_create();
    let manager = h.manager.clone();
    let spawn = tokio::spawn(async move {
        manager.spawn(request("vanish", BackendKind::Container)).await
    });

    gate.entered.notified().await;
    assert!(h.other_repo().delete("vanish").await.expect("delete"));
    gate.release.notify_one();

    let result = spawn.await.expect("spawn task");
    assert!(matches!(result, Err(AppError::Conflict(_))));
    assert_eq!(h.container.instance_count(), 0);
    assert!(matches!(
        h.manager.get("vanish", false).await,
        Err(AppError::NotFound(_))
    ));
}
