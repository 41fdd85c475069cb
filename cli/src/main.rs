//! swiftkit - keeps `sourcekit-lsp` running for one Swift package.
//!
//! ```text
//! main() -> SwiftkitConfig::load() -> Supervisor::ensure_started()
//!                                            |
//!                                            v
//!                         worker exits -> respawn -> rebind client
//! ```
//!
//! Runs until Ctrl-C, then stops the worker. Logs go to
//! `~/.swiftkit/logs/swiftkit.log`.

use std::{
    env,
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use swiftkit_config::SwiftkitConfig;
use swiftkit_lsp::LspClient;
use swiftkit_supervisor::{LspClientFactory, Supervisor};

/// How often the diagnostics summary is logged.
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates(SwiftkitConfig::path().as_deref()) {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates(config_path: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.swiftkit/logs/swiftkit.log
    if let Some(config_dir) = config_path.and_then(Path::parent) {
        candidates.push(config_dir.join("logs").join("swiftkit.log"));
    }

    // Fallback: ./.swiftkit/logs/swiftkit.log
    candidates.push(PathBuf::from(".swiftkit").join("logs").join("swiftkit.log"));

    candidates
}

/// First positional argument, else the current directory.
fn project_root(mut args: impl Iterator<Item = String>) -> Result<PathBuf> {
    let root = match args.nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => env::current_dir().context("failed to read current directory")?,
    };
    let root = fs::canonicalize(&root)
        .with_context(|| format!("project directory {} does not exist", root.display()))?;
    anyhow::ensure!(root.is_dir(), "{} is not a directory", root.display());
    Ok(root)
}

fn log_status(client: &LspClient) {
    let snapshot = client.diagnostics();
    if snapshot.is_empty() {
        tracing::info!("No diagnostics");
    } else {
        tracing::info!("Diagnostics: {}", snapshot.status_string());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let root = project_root(env::args())?;
    let config = match SwiftkitConfig::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("{e}; using defaults");
            SwiftkitConfig::default()
        }
    };

    let supervisor = Supervisor::with_policy(
        config.launch_config(&root),
        LspClientFactory::new(&root),
        config.restart_policy(),
    );
    tracing::info!(
        root = %root.display(),
        "Supervising '{}'",
        supervisor.launch_config().describe()
    );

    supervisor.subscribe(|client: &Arc<LspClient>| {
        tracing::info!(languages = ?client.languages(), "Language server client bound");
    });
    supervisor
        .ensure_started()
        .context("failed to start language server")?;

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    status.tick().await;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for Ctrl-C")?;
                break;
            }
            _ = status.tick() => {
                tracing::info!(
                    state = %supervisor.state(),
                    generation = supervisor.generation(),
                    "Worker status"
                );
                if let Some(client) = supervisor.current_client() {
                    log_status(&client);
                }
            }
        }
    }

    tracing::info!("Shutting down");
    supervisor.stop().await;
    Ok(())
}
