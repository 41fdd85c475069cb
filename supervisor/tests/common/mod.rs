//! Shared fixtures: a recording client factory and `/bin/sh` workers.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use swiftkit_supervisor::{ClientFactory, LaunchConfig, ProtocolClient, WorkerStdio};

/// Something a [`FakeClient`] was asked to do, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Created(usize),
    Language(usize, String),
    Started(usize),
    Stopped(usize),
}

pub type EventLog = Arc<Mutex<Vec<Event>>>;

/// Holds the worker's pipes open until stopped, like a real client would.
pub struct FakeClient {
    pub id: usize,
    log: EventLog,
    stdio: Mutex<Option<WorkerStdio>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl FakeClient {
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl ProtocolClient for FakeClient {
    fn add_language(&self, language_id: &str) {
        self.log
            .lock()
            .unwrap()
            .push(Event::Language(self.id, language_id.to_string()));
    }

    fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
        self.log.lock().unwrap().push(Event::Started(self.id));
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stdio.lock().unwrap().take();
        self.log.lock().unwrap().push(Event::Stopped(self.id));
    }
}

/// Cloneable so the test keeps a handle while the supervisor owns a copy.
#[derive(Clone, Default)]
pub struct FakeFactory {
    next_id: Arc<AtomicUsize>,
    pub log: EventLog,
}

impl FakeFactory {
    pub fn created(&self) -> usize {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<Event> {
        self.log.lock().unwrap().clone()
    }
}

impl ClientFactory for FakeFactory {
    type Client = FakeClient;

    fn create(&self, stdio: WorkerStdio) -> FakeClient {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(Event::Created(id));
        FakeClient {
            id,
            log: Arc::clone(&self.log),
            stdio: Mutex::new(Some(stdio)),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }
}

/// Run `script` with `/bin/sh -c` in `dir`.
pub fn sh_worker(dir: &Path, script: &str) -> LaunchConfig {
    LaunchConfig::direct("/bin/sh", ["-c", script], dir).with_language("swift")
}

/// Appends a line to `spawns` on every start, then idles until stdin closes.
pub const COUNTING_IDLE_WORKER: &str = "echo x >> spawns; exec cat > /dev/null";

/// Fails its first three starts, then idles until stdin closes.
pub const FLAKY_WORKER: &str = "n=$(cat count 2>/dev/null || echo 0); n=$((n + 1)); \
     echo $n > count; [ $n -le 3 ] && exit 1; exec cat > /dev/null";

pub fn spawn_count(dir: &Path) -> usize {
    std::fs::read_to_string(dir.join("spawns"))
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
