//! Worker restarts, client replacement and subscriber fan-out.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use swiftkit_supervisor::{RestartPolicy, Supervisor, WorkerState};

use crate::common::{
    COUNTING_IDLE_WORKER, Event, FLAKY_WORKER, FakeClient, FakeFactory, sh_worker, wait_until,
};

fn recording_observer(
    seen: &Arc<Mutex<Vec<usize>>>,
) -> impl Fn(&Arc<FakeClient>) + Send + Sync + 'static {
    let seen = Arc::clone(seen);
    move |client: &Arc<FakeClient>| seen.lock().unwrap().push(client.id)
}

#[tokio::test]
async fn late_subscriber_gets_current_client_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(sh_worker(dir.path(), COUNTING_IDLE_WORKER), FakeFactory::default());
    supervisor.ensure_started().unwrap();
    wait_until("first client", || supervisor.current_client().is_some()).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    supervisor.subscribe(recording_observer(&seen));
    assert_eq!(*seen.lock().unwrap(), vec![0]);

    supervisor.stop().await;
}

#[tokio::test]
async fn early_subscriber_is_not_called_until_bound() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(sh_worker(dir.path(), COUNTING_IDLE_WORKER), FakeFactory::default());

    let seen = Arc::new(Mutex::new(Vec::new()));
    supervisor.subscribe(recording_observer(&seen));
    assert!(seen.lock().unwrap().is_empty());

    supervisor.ensure_started().unwrap();
    wait_until("observer call", || !seen.lock().unwrap().is_empty()).await;
    assert_eq!(*seen.lock().unwrap(), vec![0]);

    supervisor.stop().await;
}

#[tokio::test]
async fn crashing_worker_is_restarted_and_rebound() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::default();
    let supervisor = Supervisor::new(sh_worker(dir.path(), FLAKY_WORKER), factory.clone());

    let early = Arc::new(Mutex::new(Vec::new()));
    supervisor.subscribe(recording_observer(&early));
    supervisor.ensure_started().unwrap();

    wait_until("fourth client", || supervisor.generation() == 4).await;
    wait_until("running worker", || supervisor.state().is_running()).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(factory.created(), 4);
    assert_eq!(*early.lock().unwrap(), vec![0, 1, 2, 3]);

    let current = supervisor.current_client().unwrap();
    assert_eq!(current.id, 3);
    assert!(current.is_started());
    assert!(!current.is_stopped());

    let late = Arc::new(Mutex::new(Vec::new()));
    supervisor.subscribe(recording_observer(&late));
    assert_eq!(*late.lock().unwrap(), vec![3]);

    supervisor.stop().await;
}

#[tokio::test]
async fn old_client_is_stopped_before_replacement_is_created() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::default();
    let supervisor = Supervisor::new(sh_worker(dir.path(), FLAKY_WORKER), factory.clone());
    supervisor.ensure_started().unwrap();
    wait_until("fourth client", || supervisor.generation() == 4).await;

    let events = factory.events();
    let position = |event: &Event| events.iter().position(|e| e == event).unwrap();
    for id in 0..4 {
        let created = position(&Event::Created(id));
        let language = position(&Event::Language(id, "swift".to_string()));
        let started = position(&Event::Started(id));
        assert!(created < language && language < started, "{events:?}");
        if id > 0 {
            assert!(position(&Event::Stopped(id - 1)) < created, "{events:?}");
        }
    }
    assert!(!events.contains(&Event::Stopped(3)));

    supervisor.stop().await;
    assert!(factory.events().contains(&Event::Stopped(3)));
}

#[tokio::test]
async fn restart_limit_ends_supervision() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::default();
    let supervisor = Supervisor::with_policy(
        sh_worker(dir.path(), "exit 3"),
        factory.clone(),
        RestartPolicy::limited(2),
    );
    supervisor.ensure_started().unwrap();

    wait_until("worker given up", || {
        supervisor.state() == WorkerState::Exited { code: Some(3) }
            && supervisor.current_client().is_none()
            && factory.created() == 3
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(factory.created(), 3);
    assert_eq!(supervisor.generation(), 3);
    assert!(factory.events().contains(&Event::Stopped(2)));

    supervisor.stop().await;
    assert_eq!(supervisor.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn restart_delay_is_honored() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::default();
    let supervisor = Supervisor::with_policy(
        sh_worker(dir.path(), FLAKY_WORKER),
        factory.clone(),
        RestartPolicy::unlimited().with_delay(Duration::from_millis(100)),
    );

    let started = tokio::time::Instant::now();
    supervisor.ensure_started().unwrap();
    wait_until("fourth client", || supervisor.generation() == 4).await;

    assert!(started.elapsed() >= Duration::from_millis(300));
    supervisor.stop().await;
}

#[tokio::test]
async fn stop_during_restart_delay_does_not_respawn() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::default();
    let supervisor = Supervisor::with_policy(
        sh_worker(dir.path(), "exit 1"),
        factory.clone(),
        RestartPolicy::unlimited().with_delay(Duration::from_secs(30)),
    );
    supervisor.ensure_started().unwrap();
    wait_until("first exit", || {
        matches!(supervisor.state(), WorkerState::Exited { .. })
    })
    .await;

    tokio::time::timeout(Duration::from_secs(5), supervisor.stop())
        .await
        .unwrap();

    assert_eq!(factory.created(), 1);
    assert_eq!(supervisor.state(), WorkerState::Stopped);
    assert!(supervisor.current_client().is_none());
}

#[tokio::test]
async fn panicking_observer_does_not_stop_supervision() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::default();
    let supervisor = Supervisor::new(sh_worker(dir.path(), FLAKY_WORKER), factory.clone());

    supervisor.subscribe(|client: &Arc<FakeClient>| {
        assert!(client.id != 0, "observer rejects the first client");
    });
    let seen = Arc::new(Mutex::new(Vec::new()));
    supervisor.subscribe(recording_observer(&seen));
    supervisor.ensure_started().unwrap();

    wait_until("fourth client", || supervisor.generation() == 4).await;
    wait_until("running worker", || supervisor.state().is_running()).await;

    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
    assert_eq!(supervisor.current_client().unwrap().id, 3);

    supervisor.stop().await;
    assert_eq!(supervisor.state(), WorkerState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subscribers_racing_rebinds_see_every_later_client_once() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::default();
    let supervisor = Arc::new(Supervisor::with_policy(
        sh_worker(dir.path(), FLAKY_WORKER),
        factory.clone(),
        RestartPolicy::unlimited().with_delay(Duration::from_millis(20)),
    ));

    let subscriber = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            let mut logs = Vec::new();
            for _ in 0..40 {
                let seen = Arc::new(Mutex::new(Vec::new()));
                supervisor.subscribe(recording_observer(&seen));
                logs.push(seen);
                tokio::time::sleep(Duration::from_millis(3)).await;
            }
            logs
        })
    };
    supervisor.ensure_started().unwrap();
    let logs = subscriber.await.unwrap();

    wait_until("fourth client", || supervisor.generation() == 4).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    for log in &logs {
        let ids = log.lock().unwrap().clone();
        assert_eq!(ids.last(), Some(&3), "{ids:?}");
        assert!(
            ids.windows(2).all(|pair| pair[1] == pair[0] + 1),
            "duplicate or missed client: {ids:?}"
        );
    }
    supervisor.stop().await;
}
