//! Worker supervision and client rebinding.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use swiftkit_types::{RestartPolicy, WorkerState};

use crate::binding::Binding;
use crate::client::{ClientFactory, LspClientFactory, ProtocolClient};
use crate::error::SupervisorError;
use crate::launch::{LaunchConfig, WorkerStdio};

/// How long a stopped worker gets to exit on its own before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps one worker process alive and one client bound to it.
///
/// The worker is spawned lazily by [`ensure_started`](Self::ensure_started).
/// Each time it exits, a replacement is spawned, the old client is stopped
/// and a new client is bound to the new worker's stdio and published to
/// subscribers. All rebinds happen on a single monitoring task, so they
/// never overlap.
pub struct Supervisor<F: ClientFactory = LspClientFactory> {
    inner: Arc<Inner<F>>,
}

struct Inner<F: ClientFactory> {
    launch: LaunchConfig,
    factory: F,
    policy: RestartPolicy,
    started: AtomicBool,
    binding: Binding<F::Client>,
    state: Mutex<WorkerState>,
    monitor: Mutex<Option<Monitor>>,
}

struct Monitor {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Supervisor<LspClientFactory> {
    /// `sourcekit-lsp` for the package at `project_root`.
    #[must_use]
    pub fn sourcekit(project_root: impl Into<PathBuf>) -> Self {
        let root = project_root.into();
        Self::new(
            LaunchConfig::sourcekit(root.clone()),
            LspClientFactory::new(root),
        )
    }
}

impl<F: ClientFactory> Supervisor<F> {
    #[must_use]
    pub fn new(launch: LaunchConfig, factory: F) -> Self {
        Self::with_policy(launch, factory, RestartPolicy::default())
    }

    #[must_use]
    pub fn with_policy(launch: LaunchConfig, factory: F, policy: RestartPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                launch,
                factory,
                policy,
                started: AtomicBool::new(false),
                binding: Binding::new(),
                state: Mutex::new(WorkerState::Unstarted),
                monitor: Mutex::new(None),
            }),
        }
    }

    /// Spawn the worker and bind the first client, once.
    ///
    /// Later calls return `Ok(())` without doing anything, including calls
    /// racing the first one. The first client is published asynchronously,
    /// so [`current_client`](Self::current_client) may still be `None` right
    /// after this returns. A failed spawn is reported here and leaves the
    /// supervisor unstarted so the call can be retried.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn ensure_started(&self) -> Result<(), SupervisorError> {
        // Held across the spawn so a concurrent stop() waits for the monitor
        // to exist and then tears it down.
        let mut monitor = lock(&self.inner.monitor);
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.inner.set_state(WorkerState::Starting);
        let child = match self.inner.launch.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("Failed to start worker '{}': {e}", self.inner.launch.describe());
                self.inner.set_state(WorkerState::Unstarted);
                self.inner.started.store(false, Ordering::Release);
                return Err(e);
            }
        };
        tracing::info!(
            pid = ?child.id(),
            cwd = %self.inner.launch.working_dir.display(),
            "Started worker '{}'",
            self.inner.launch.describe()
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(Arc::clone(&self.inner).supervise(child, stop_rx));
        *monitor = Some(Monitor { stop_tx, handle });
        Ok(())
    }

    /// The client bound to the live worker, if any.
    #[must_use]
    pub fn current_client(&self) -> Option<Arc<F::Client>> {
        self.inner.binding.current()
    }

    /// Call `observer` with every client bound from now on.
    ///
    /// If a client is already bound, `observer` is called with it before this
    /// returns. Observers run on the monitoring task and must not block or
    /// call `subscribe`.
    pub fn subscribe<O>(&self, observer: O)
    where
        O: Fn(&Arc<F::Client>) + Send + Sync + 'static,
    {
        self.inner.binding.subscribe(Box::new(observer));
    }

    /// Kill the worker and unbind its client without restarting.
    ///
    /// Waits for the monitoring task to finish. A no-op when nothing is
    /// running. Afterwards [`ensure_started`](Self::ensure_started) starts a
    /// fresh worker.
    pub async fn stop(&self) {
        let Some(monitor) = lock(&self.inner.monitor).take() else {
            return;
        };
        let _ = monitor.stop_tx.send(());
        if let Err(e) = monitor.handle.await
            && e.is_panic()
        {
            tracing::error!("Worker monitor panicked: {e}");
        }

        // The monitor may have given up on its own before we got here. Only
        // report Stopped if nobody started a new worker in the meantime.
        let slot = lock(&self.inner.monitor);
        if slot.is_none() {
            self.inner.set_state(WorkerState::Stopped);
        }
        drop(slot);
        tracing::info!("Stopped worker '{}'", self.inner.launch.describe());
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        *lock(&self.inner.state)
    }

    /// Number of clients bound so far.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.binding.generation()
    }

    #[must_use]
    pub fn launch_config(&self) -> &LaunchConfig {
        &self.inner.launch
    }

    #[must_use]
    pub fn restart_policy(&self) -> RestartPolicy {
        self.inner.policy
    }
}

impl<F: ClientFactory> Drop for Supervisor<F> {
    fn drop(&mut self) {
        // The monitoring task holds `inner`; signal it so it tears down.
        if let Some(monitor) = lock(&self.inner.monitor).take() {
            let _ = monitor.stop_tx.send(());
        }
    }
}

impl<F: ClientFactory> std::fmt::Debug for Supervisor<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("command", &self.inner.launch.describe())
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl<F: ClientFactory> Inner<F> {
    fn set_state(&self, state: WorkerState) {
        *lock(&self.state) = state;
    }

    /// Stop and drop the current client, if any.
    fn release_client(&self) {
        if let Some(old) = self.binding.take() {
            old.stop();
        }
    }

    /// Retire the old client, then bind and publish a new one on `child`.
    fn rebind(&self, child: &mut Child) -> Result<u64, SupervisorError> {
        let stdio = WorkerStdio::take_from(child)?;
        self.release_client();

        let client = self.factory.create(stdio);
        for language in &self.launch.languages {
            client.add_language(language);
        }
        client.start();
        Ok(self.binding.publish(Arc::new(client)))
    }

    async fn supervise(self: Arc<Self>, mut child: Child, mut stop_rx: oneshot::Receiver<()>) {
        let _unwind = UnwindReset(Arc::clone(&self));
        let mut restarts: u32 = 0;

        let end_state = loop {
            let pid = child.id();
            match self.rebind(&mut child) {
                Ok(generation) => {
                    tracing::info!(generation, pid = ?pid, "Bound client to worker");
                }
                Err(e) => {
                    tracing::error!("Failed to bind client to worker: {e}");
                    terminate(&mut child).await;
                    break WorkerState::Exited { code: None };
                }
            }
            self.set_state(WorkerState::Running { pid });

            let status = tokio::select! {
                status = child.wait() => status,
                _ = &mut stop_rx => {
                    self.release_client();
                    terminate(&mut child).await;
                    break WorkerState::Stopped;
                }
            };
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!("Failed to wait on worker: {e}");
                    None
                }
            };
            tracing::warn!(pid = ?pid, code = ?code, "Worker exited");
            self.set_state(WorkerState::Exited { code });

            if !self.policy.allows_restart(restarts) {
                tracing::warn!(restarts, "Worker restart limit reached; not restarting");
                break WorkerState::Exited { code };
            }
            restarts += 1;

            if !self.policy.delay.is_zero() {
                tokio::select! {
                    () = tokio::time::sleep(self.policy.delay) => {}
                    _ = &mut stop_rx => break WorkerState::Stopped,
                }
            }

            self.set_state(WorkerState::Starting);
            child = match self.launch.spawn() {
                Ok(child) => child,
                Err(e) => {
                    tracing::error!("Failed to restart worker '{}': {e}", self.launch.describe());
                    break WorkerState::Exited { code };
                }
            };
            tracing::info!(pid = ?child.id(), restarts, "Restarted worker");
        };

        self.release_client();
        self.set_state(end_state);
        self.started.store(false, Ordering::Release);
        tracing::debug!("Worker monitor finished ({end_state})");
    }
}

/// Leaves the supervisor restartable if the monitor task unwinds.
struct UnwindReset<F: ClientFactory>(Arc<Inner<F>>);

impl<F: ClientFactory> Drop for UnwindReset<F> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::error!("Worker monitor unwound; releasing client");
            self.0.release_client();
            self.0.set_state(WorkerState::Exited { code: None });
            self.0.started.store(false, Ordering::Release);
        }
    }
}

/// Wait briefly for the worker to exit, then kill it.
async fn terminate(child: &mut Child) {
    match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!("Worker exited with {status}"),
        Ok(Err(e)) => tracing::warn!("Failed to wait on worker: {e}"),
        Err(_) => {
            tracing::debug!("Worker did not exit in time; killing");
            if let Err(e) = child.kill().await {
                tracing::warn!("Failed to kill worker: {e}");
            }
        }
    }
}
