//! Tests for the cluster session backend.
//!
//! Every scenario runs against the scriptable in-memory cluster: the test
//! plays the role of the workload (writing output, exiting, failing to start)
//! and checks what the backend reports.

use magikube::cluster::ExecOutput;
use magikube::constants::{GRACEFUL_STOP_COMMAND, MAX_INJECTED_FILE_BYTES, SESSION_ID_LABEL};
use magikube::session::VolumeSpec;
use magikube::{
    BackendConfig, ClusterBackend, Error, ListFilter, MemoryCluster, SessionBackend, SessionId,
    SessionSpec, SessionStatus,
};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Helpers
// =============================================================================

fn config() -> BackendConfig {
    BackendConfig {
        ready_poll_interval: Duration::from_millis(10),
        stream_drain_timeout: Duration::from_secs(2),
        ..BackendConfig::default()
    }
}

fn backend(cluster: &Arc<MemoryCluster>) -> ClusterBackend {
    ClusterBackend::new(cluster.clone(), config())
}

fn echo() -> SessionSpec {
    SessionSpec::new("alpine:3.20").with_command(["echo", "hi"])
}

async fn within<T>(future: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

/// Waits until the cluster holds a workload and returns its name.
async fn first_workload(cluster: &MemoryCluster) -> String {
    within(async {
        loop {
            if let Some(name) = cluster.workload_names().into_iter().next() {
                return name;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

// =============================================================================
// Run and Exit
// =============================================================================

#[tokio::test]
async fn test_echo_session() {
    let cluster = Arc::new(MemoryCluster::new());
    let backend = backend(&cluster);

    let handle = backend.run(echo()).await.unwrap();
    assert_eq!(handle.status(), SessionStatus::Running);
    assert_eq!(handle.id().as_str().len(), 32);

    cluster
        .write_stdout(handle.workload_name(), b"hi\n")
        .await
        .unwrap();
    cluster.complete(handle.workload_name(), 0).await.unwrap();

    let exit = within(handle.exited()).await.unwrap();
    assert_eq!(exit.exit_code, 0);
    assert!(exit.error.is_none());
    assert_eq!(handle.stdout().read_to_end().await, b"hi\n");

    let info = backend.get(handle.id()).await.unwrap();
    assert_eq!(info.status, SessionStatus::Stopped);
    assert_eq!(info.exit_code, Some(0));
    assert!(!info.reconstructed);
}

#[tokio::test]
async fn test_nonzero_exit_fails_session() {
    let cluster = Arc::new(MemoryCluster::new());
    let backend = backend(&cluster);

    let handle = backend
        .run(SessionSpec::new("alpine").with_command(["sh", "-c", "exit 42"]))
        .await
        .unwrap();
    cluster.complete(handle.workload_name(), 42).await.unwrap();

    let exit = within(handle.exited()).await.unwrap();
    assert_eq!(exit.exit_code, 42);
    assert_eq!(handle.status(), SessionStatus::Failed);
}

#[tokio::test]
async fn test_stdin_reaches_workload() {
    let cluster = Arc::new(MemoryCluster::new());
    let backend = backend(&cluster);
    let mut spec = SessionSpec::new("alpine").with_command(["cat"]);
    spec.stdin = true;

    let handle = backend.run(spec).await.unwrap();
    assert!(handle.stdin().is_attached().await);
    handle.stdin().write(b"hello\n").await.unwrap();

    let received = within(async {
        loop {
            let received = cluster.stdin_received(handle.workload_name());
            if !received.is_empty() {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert_eq!(received, b"hello\n");
}

// =============================================================================
// Kill, Stop, Destroy
// =============================================================================

#[tokio::test]
async fn test_kill_reports_killed_and_leaves_list() {
    let cluster = Arc::new(MemoryCluster::new());
    let backend = backend(&cluster);
    let handle = backend
        .run(SessionSpec::new("alpine").with_command(["sleep", "3600"]))
        .await
        .unwrap();

    backend.kill(handle.id()).await.unwrap();
    let exit = within(handle.exited()).await.unwrap();

    assert!(exit.killed);
    assert_eq!(exit.exit_code, 137);
    assert_eq!(handle.status(), SessionStatus::Killed);
    let listed = backend.list(&ListFilter::default()).await.unwrap();
    assert!(listed.iter().all(|s| &s.id != handle.id()));
}

#[tokio::test]
async fn test_kill_racing_natural_exit_yields_one_result() {
    let cluster = Arc::new(MemoryCluster::new());
    let backend = Arc::new(backend(&cluster));
    let handle = backend.run(echo()).await.unwrap();

    let killer = {
        let backend = backend.clone();
        let id = handle.id().clone();
        tokio::spawn(async move { backend.kill(&id).await })
    };
    let finisher = {
        let cluster = cluster.clone();
        let name = handle.workload_name().to_string();
        tokio::spawn(async move { cluster.complete(&name, 0).await })
    };
    let _ = killer.await.unwrap();
    let _ = finisher.await.unwrap();

    let exit = within(handle.exited()).await.unwrap();
    assert_eq!(handle.status(), exit.status());
    assert_eq!(handle.exit_code(), Some(exit.exit_code));
    if exit.killed {
        assert_eq!(exit.exit_code, 137);
    } else {
        assert_eq!(exit.exit_code, 0);
    }
}

#[tokio::test]
async fn test_kill_unknown_session() {
    let cluster = Arc::new(MemoryCluster::new());
    let err = backend(&cluster)
        .kill(&SessionId::from("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(_)), "{err}");
}

#[tokio::test]
async fn test_stop_requests_graceful_termination() {
    let cluster = Arc::new(MemoryCluster::new());
    let backend = backend(&cluster);
    let handle = backend.run(echo()).await.unwrap();

    backend.stop(handle.id()).await.unwrap();
    assert_eq!(handle.status(), SessionStatus::Stopping);

    let log = cluster.exec_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].0, handle.workload_name());
    assert_eq!(log[0].1, GRACEFUL_STOP_COMMAND);

    // The workload honours the request.
    cluster.complete(handle.workload_name(), 0).await.unwrap();
    within(handle.exited()).await.unwrap();
    assert_eq!(handle.status(), SessionStatus::Stopped);
}

#[tokio::test]
async fn test_destroy_is_idempotent_and_removes_everything() {
    let cluster = Arc::new(MemoryCluster::new());
    let backend = backend(&cluster);
    let mut spec = echo().with_file("/etc/app.conf", "x=1");
    spec.volumes.push(VolumeSpec {
        name: "data".into(),
        mount_path: "/data".into(),
        size: "1Gi".into(),
        storage_class: None,
    });
    let handle = backend.run(spec).await.unwrap();
    assert_eq!(cluster.artifact_names().len(), 1);
    assert_eq!(cluster.claim_names().len(), 1);

    backend.destroy(handle.id()).await.unwrap();
    backend.destroy(handle.id()).await.unwrap();

    assert!(handle.is_closed());
    assert!(cluster.workload_names().is_empty());
    assert!(cluster.artifact_names().is_empty());
    assert!(cluster.claim_names().is_empty());
    assert!(backend.registry().is_empty());
    assert!(backend.get(handle.id()).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_destroy_unknown_session_succeeds() {
    let cluster = Arc::new(MemoryCluster::new());
    backend(&cluster)
        .destroy(&SessionId::from("never-existed"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_destroy_wakes_waiter() {
    let cluster = Arc::new(MemoryCluster::new());
    let backend = backend(&cluster);
    let handle = backend
        .run(SessionSpec::new("alpine").with_command(["sleep", "1000"]))
        .await
        .unwrap();
    let waiter = handle.wait();

    backend.destroy(handle.id()).await.unwrap();
    let exit = within(waiter.recv()).await.unwrap();

    assert!(exit.killed);
    assert_eq!(exit.exit_code, 137);
    assert_eq!(handle.status(), SessionStatus::Killed);
}

// =============================================================================
// Validation and Rollback
// =============================================================================

#[tokio::test]
async fn test_file_payload_at_limit_is_accepted() {
    let cluster = Arc::new(MemoryCluster::new());
    let backend = backend(&cluster);
    let spec = echo().with_file("/data/blob.txt", vec![b'a'; MAX_INJECTED_FILE_BYTES]);

    let handle = backend.run(spec).await.unwrap();
    let artifact = cluster
        .artifact(&format!("{}-files", handle.workload_name()))
        .unwrap();
    assert_eq!(artifact.data.text["-data-blob.txt"].len(), MAX_INJECTED_FILE_BYTES);
}

#[tokio::test]
async fn test_file_payload_over_limit_creates_nothing() {
    let cluster = Arc::new(MemoryCluster::new());
    let backend = backend(&cluster);
    let spec = echo().with_file("/data/blob.txt", vec![b'a'; MAX_INJECTED_FILE_BYTES + 1]);

    let err = backend.run(spec).await.unwrap_err();
    assert!(matches!(err, Error::PayloadTooLarge { .. }), "{err}");
    assert_eq!(cluster.workloads_created(), 0);
    assert!(cluster.artifact_names().is_empty());
}

#[tokio::test]
async fn test_invalid_spec_is_rejected() {
    let cluster = Arc::new(MemoryCluster::new());
    let backend = backend(&cluster);

    let err = backend.run(SessionSpec::default()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let err = backend
        .run(echo().with_label(SESSION_ID_LABEL, "spoofed"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert_eq!(cluster.workloads_created(), 0);
}

#[tokio::test]
async fn test_create_failure_rolls_back() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.set_fail_workload_creates(true);
    let backend = backend(&cluster);
    let mut spec = echo().with_file("/etc/app.conf", "x=1");
    spec.volumes.push(VolumeSpec {
        name: "data".into(),
        mount_path: "/data".into(),
        size: "1Gi".into(),
        storage_class: None,
    });

    let err = backend.run(spec).await.unwrap_err();
    assert!(matches!(err, Error::Api { .. }), "{err}");
    assert!(cluster.artifact_names().is_empty());
    assert!(cluster.claim_names().is_empty());
    assert!(backend.registry().is_empty());
}

#[tokio::test]
async fn test_image_pull_failure_is_terminal() {
    let cluster = Arc::new(MemoryCluster::new().with_auto_start(false));
    let backend = Arc::new(backend(&cluster));

    let run = {
        let backend = backend.clone();
        tokio::spawn(async move { backend.run(SessionSpec::new("does-not-exist:latest")).await })
    };
    let name = first_workload(&cluster).await;
    cluster.fail_start(&name, "ErrImagePull").unwrap();

    let err = within(run).await.unwrap().unwrap_err();
    assert!(matches!(err, Error::TerminalState { .. }), "{err}");
    assert!(err.to_string().contains("ErrImagePull"));
    assert!(cluster.workload_names().is_empty(), "rolled back");
}

#[tokio::test]
async fn test_setup_failure_is_terminal() {
    let cluster = Arc::new(MemoryCluster::new().with_auto_start(false));
    let backend = Arc::new(backend(&cluster));

    let run = {
        let backend = backend.clone();
        tokio::spawn(async move { backend.run(echo().with_setup("exit 3")).await })
    };
    let name = first_workload(&cluster).await;
    cluster
        .fail_setup(&name, "setup step 'setup-0' exited with code 3")
        .unwrap();

    let err = within(run).await.unwrap().unwrap_err();
    assert!(matches!(err, Error::TerminalState { .. }), "{err}");
    assert!(err.to_string().contains("setup-0"));
}

#[tokio::test]
async fn test_not_ready_times_out() {
    let cluster = Arc::new(MemoryCluster::new().with_auto_start(false));
    let backend = ClusterBackend::new(
        cluster.clone(),
        config().with_ready_timeout(Duration::from_millis(100)),
    );

    let err = within(backend.run(echo())).await.unwrap_err();
    assert!(matches!(err, Error::NotReady { .. }), "{err}");
    assert!(err.is_timeout());
    assert!(cluster.workload_names().is_empty(), "rolled back");
}

#[tokio::test]
async fn test_delayed_start_becomes_ready() {
    let cluster = Arc::new(MemoryCluster::new().with_auto_start(false));
    let backend = Arc::new(backend(&cluster));

    let run = {
        let backend = backend.clone();
        tokio::spawn(async move { backend.run(echo()).await })
    };
    let name = first_workload(&cluster).await;
    cluster.start(&name).unwrap();

    let handle = within(run).await.unwrap().unwrap();
    assert_eq!(handle.status(), SessionStatus::Running);
}

// =============================================================================
// Attach, Get, List
// =============================================================================

#[tokio::test]
async fn test_attach_reconstructs_from_cluster() {
    let cluster = Arc::new(MemoryCluster::new());
    let original = backend(&cluster);
    let handle = original
        .run(echo().with_label("team", "infra").with_env("MODE", "test"))
        .await
        .unwrap();

    // A second backend sharing the cluster knows nothing about the session.
    let other = backend(&cluster);
    let info = other.get(handle.id()).await.unwrap();
    assert!(info.reconstructed);
    assert_eq!(info.status, SessionStatus::Running);
    assert_eq!(info.image, "alpine:3.20");
    assert_eq!(info.labels.get("team").map(String::as_str), Some("infra"));

    let attached = other.attach(handle.id()).await.unwrap();
    assert_eq!(attached.id(), handle.id());
    assert_eq!(attached.spec().command, vec!["echo", "hi"]);
    assert_eq!(attached.spec().env.get("MODE").map(String::as_str), Some("test"));
    assert!(attached.info().reconstructed);

    let again = other.attach(handle.id()).await.unwrap();
    assert!(Arc::ptr_eq(&attached, &again));

    cluster.complete(handle.workload_name(), 5).await.unwrap();
    let exit = within(attached.exited()).await.unwrap();
    assert_eq!(exit.exit_code, 5);
}

#[tokio::test]
async fn test_attach_unknown_session() {
    let cluster = Arc::new(MemoryCluster::new());
    let err = backend(&cluster)
        .attach(&SessionId::from("nope"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(_)));
}

#[tokio::test]
async fn test_list_filters_by_label_and_status() {
    let cluster = Arc::new(MemoryCluster::new());
    let backend = backend(&cluster);
    let a = backend.run(echo().with_label("team", "a")).await.unwrap();
    let b = backend.run(echo().with_label("team", "b")).await.unwrap();

    let all = backend.list(&ListFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);

    let team_a = backend
        .list(&ListFilter {
            labels: [("team".to_string(), "a".to_string())].into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(team_a.len(), 1);
    assert_eq!(&team_a[0].id, a.id());

    cluster.complete(b.workload_name(), 0).await.unwrap();
    within(b.exited()).await.unwrap();

    let stopped = backend
        .list(&ListFilter {
            status: Some(SessionStatus::Stopped),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(stopped.len(), 1);
    assert_eq!(&stopped[0].id, b.id());

    let running = backend
        .list(&ListFilter {
            status: Some(SessionStatus::Running),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(&running[0].id, a.id());
}

// =============================================================================
// Exec, Health, Close
// =============================================================================

#[tokio::test]
async fn test_exec_returns_output_and_code() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.set_exec_responder(|_, command| ExecOutput {
        stdout: format!("ran {}\n", command.join(" ")).into_bytes(),
        stderr: b"warn\n".to_vec(),
        exit_code: 3,
    });
    let backend = backend(&cluster);
    let handle = backend.run(echo()).await.unwrap();

    let result = backend
        .exec(handle.id(), &["ls".to_string(), "/".to_string()])
        .await
        .unwrap();
    assert_eq!(result.exit_code, 3);
    assert_eq!(result.stdout, b"ran ls /\n");
    assert_eq!(result.output, b"ran ls /\nwarn\n");

    let err = backend.exec(handle.id(), &[]).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let err = backend
        .exec(&SessionId::from("nope"), &["ls".to_string()])
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_health() {
    let cluster = Arc::new(MemoryCluster::new());
    let backend = backend(&cluster);
    backend.health().await.unwrap();
    assert_eq!(backend.name(), "memory");

    cluster.set_healthy(false);
    assert!(backend.health().await.is_err());
}

#[tokio::test]
async fn test_close_releases_handles() {
    let cluster = Arc::new(MemoryCluster::new());
    let backend = backend(&cluster);
    let handle = backend.run(echo()).await.unwrap();

    backend.close().await;
    assert!(handle.is_closed());
    assert!(backend.registry().is_empty());
    // Closing does not delete cluster resources.
    assert_eq!(cluster.workload_names().len(), 1);
}

#[tokio::test]
async fn test_close_wakes_waiter() {
    let cluster = Arc::new(MemoryCluster::new());
    let backend = backend(&cluster);
    let handle = backend
        .run(SessionSpec::new("alpine").with_command(["sleep", "1000"]))
        .await
        .unwrap();
    let waiter = handle.wait();

    backend.close().await;
    let exit = within(waiter.recv()).await.unwrap();

    assert!(!exit.killed);
    assert_eq!(exit.error.as_deref(), Some("backend closed"));
    assert_eq!(handle.status(), SessionStatus::Failed);
}
