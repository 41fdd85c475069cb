//! Starting, stopping and failing to start.

use std::sync::Arc;
use std::time::Duration;

use swiftkit_supervisor::{LaunchConfig, Supervisor, SupervisorError, WorkerState};

use crate::common::{COUNTING_IDLE_WORKER, FakeFactory, sh_worker, spawn_count, wait_until};

#[test]
fn nothing_is_bound_before_start() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(sh_worker(dir.path(), COUNTING_IDLE_WORKER), FakeFactory::default());

    assert!(supervisor.current_client().is_none());
    assert_eq!(supervisor.state(), WorkerState::Unstarted);
    assert_eq!(supervisor.generation(), 0);
    assert_eq!(spawn_count(dir.path()), 0);
}

#[tokio::test]
async fn ensure_started_spawns_once() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::default();
    let supervisor = Supervisor::new(sh_worker(dir.path(), COUNTING_IDLE_WORKER), factory.clone());

    supervisor.ensure_started().unwrap();
    supervisor.ensure_started().unwrap();
    supervisor.ensure_started().unwrap();

    wait_until("first client", || supervisor.current_client().is_some()).await;
    wait_until("worker marker", || spawn_count(dir.path()) == 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(spawn_count(dir.path()), 1);
    assert_eq!(factory.created(), 1);
    assert_eq!(supervisor.generation(), 1);
    assert!(supervisor.state().is_running());

    let client = supervisor.current_client().unwrap();
    assert!(client.is_started());
    supervisor.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ensure_started_spawns_once() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::default();
    let supervisor = Arc::new(Supervisor::new(
        sh_worker(dir.path(), COUNTING_IDLE_WORKER),
        factory.clone(),
    ));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.ensure_started() })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    wait_until("first client", || supervisor.current_client().is_some()).await;
    wait_until("worker marker", || spawn_count(dir.path()) == 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(spawn_count(dir.path()), 1);
    assert_eq!(factory.created(), 1);
    supervisor.stop().await;
}

#[tokio::test]
async fn worker_runs_in_configured_directory() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(
        sh_worker(dir.path(), "pwd > cwd; exec cat > /dev/null"),
        FakeFactory::default(),
    );
    supervisor.ensure_started().unwrap();

    let marker = dir.path().join("cwd");
    wait_until("cwd marker", || {
        std::fs::read_to_string(&marker).is_ok_and(|s| s.ends_with('\n'))
    })
    .await;
    let reported = std::fs::read_to_string(&marker).unwrap();
    assert_eq!(
        std::fs::canonicalize(reported.trim()).unwrap(),
        std::fs::canonicalize(dir.path()).unwrap()
    );
    supervisor.stop().await;
}

#[tokio::test]
async fn stop_unbinds_and_stops_client() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(sh_worker(dir.path(), COUNTING_IDLE_WORKER), FakeFactory::default());
    supervisor.ensure_started().unwrap();
    wait_until("first client", || supervisor.current_client().is_some()).await;
    let client = supervisor.current_client().unwrap();

    supervisor.stop().await;

    assert!(client.is_stopped());
    assert!(supervisor.current_client().is_none());
    assert_eq!(supervisor.state(), WorkerState::Stopped);

    // Idempotent.
    supervisor.stop().await;
    assert_eq!(supervisor.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn stop_without_start_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(sh_worker(dir.path(), COUNTING_IDLE_WORKER), FakeFactory::default());

    supervisor.stop().await;

    assert_eq!(supervisor.state(), WorkerState::Unstarted);
    assert!(supervisor.current_client().is_none());
    assert_eq!(spawn_count(dir.path()), 0);
}

#[tokio::test]
async fn ensure_started_after_stop_spawns_fresh_worker() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::default();
    let supervisor = Supervisor::new(sh_worker(dir.path(), COUNTING_IDLE_WORKER), factory.clone());

    supervisor.ensure_started().unwrap();
    wait_until("first client", || supervisor.generation() == 1).await;
    supervisor.stop().await;

    supervisor.ensure_started().unwrap();
    wait_until("second client", || supervisor.generation() == 2).await;
    wait_until("second worker marker", || spawn_count(dir.path()) == 2).await;

    let client = supervisor.current_client().unwrap();
    assert_eq!(client.id, 1);
    assert!(!client.is_stopped());
    assert_eq!(factory.created(), 2);
    supervisor.stop().await;
}

#[tokio::test]
async fn spawn_failure_is_reported_and_retryable() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::default();
    let launch = LaunchConfig::direct(
        dir.path().join("no-such-worker"),
        Vec::<String>::new(),
        dir.path(),
    );
    let supervisor = Supervisor::new(launch, factory.clone());

    let err = supervisor.ensure_started().unwrap_err();
    assert!(matches!(err, SupervisorError::BinaryNotFound { .. }), "{err:?}");
    assert!(supervisor.current_client().is_none());
    assert_eq!(supervisor.state(), WorkerState::Unstarted);
    assert_eq!(factory.created(), 0);

    // The latch was released, so the next call tries again.
    assert!(supervisor.ensure_started().is_err());
}

#[tokio::test]
async fn login_shell_launch_binds_client() {
    if !std::path::Path::new("/bin/bash").exists() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let launch = LaunchConfig::login_shell("/bin/bash", "exec cat > /dev/null", dir.path())
        .with_language("swift");
    let supervisor = Supervisor::new(launch, FakeFactory::default());

    supervisor.ensure_started().unwrap();
    wait_until("first client", || supervisor.current_client().is_some()).await;
    assert!(supervisor.state().is_running());
    supervisor.stop().await;
}

#[cfg(target_os = "linux")]
mod stderr_wiring {
    use swiftkit_supervisor::{StderrMode, Supervisor};

    use crate::common::{FakeFactory, sh_worker, wait_until};

    const REPORT_STDERR: &str = "readlink /proc/$$/fd/2 > fd2; exec cat > /dev/null";

    async fn worker_stderr(mode: StderrMode) -> String {
        let dir = tempfile::tempdir().unwrap();
        let launch = sh_worker(dir.path(), REPORT_STDERR).with_stderr(mode);
        let supervisor = Supervisor::new(launch, FakeFactory::default());
        supervisor.ensure_started().unwrap();

        let report = dir.path().join("fd2");
        wait_until("stderr report", || {
            std::fs::read_to_string(&report).is_ok_and(|s| s.ends_with('\n'))
        })
        .await;
        supervisor.stop().await;
        std::fs::read_to_string(&report).unwrap().trim().to_string()
    }

    #[tokio::test]
    async fn quiet_worker_writes_stderr_to_null() {
        assert_eq!(worker_stderr(StderrMode::Null).await, "/dev/null");
    }

    #[tokio::test]
    async fn dev_mode_worker_shares_our_stderr() {
        let ours = std::fs::read_link("/proc/self/fd/2").unwrap();
        assert_eq!(
            worker_stderr(StderrMode::Inherit).await,
            ours.display().to_string()
        );
    }
}
