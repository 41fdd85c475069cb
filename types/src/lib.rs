//! Core domain types for swiftkit.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the application.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

// ============================================================================
// Worker lifecycle
// ============================================================================

/// Supervision state of the worker process.
///
/// ```text
/// Unstarted -> Starting -> Running -> Exited -> Starting -> ...
///                                        \
///  (any) ---------- stop() ---------------> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    #[default]
    Unstarted,
    Starting,
    Running {
        pid: Option<u32>,
    },
    /// The worker exited. `code` is `None` when it was killed by a signal.
    Exited {
        code: Option<i32>,
    },
    Stopped,
}

impl WorkerState {
    #[must_use]
    pub fn is_running(self) -> bool {
        matches!(self, Self::Running { .. })
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Starting => "starting",
            Self::Running { .. } => "running",
            Self::Exited { .. } => "exited",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running { pid: Some(pid) } => write!(f, "running (pid {pid})"),
            Self::Exited { code: Some(code) } => write!(f, "exited (code {code})"),
            Self::Exited { code: None } => write!(f, "exited (signal)"),
            other => f.write_str(other.label()),
        }
    }
}

// ============================================================================
// Launch policies
// ============================================================================

/// What happens to the worker's standard error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrMode {
    /// Surface worker stderr on ours (debug mode).
    Inherit,
    /// Discard worker stderr.
    #[default]
    Null,
}

impl StderrMode {
    /// Environment variable that switches stderr to [`StderrMode::Inherit`].
    pub const DEV_MODE_VAR: &'static str = "DEV_MODE";

    /// Map the raw value of `DEV_MODE` to a mode. Unset or empty means quiet.
    #[must_use]
    pub fn from_dev_mode(value: Option<&str>) -> Self {
        match value {
            Some(v) if !v.is_empty() => Self::Inherit,
            _ => Self::Null,
        }
    }
}

/// How the worker's environment is derived from ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvPolicy {
    /// Pass our environment through unchanged.
    #[default]
    Inherit,
    /// Pass our environment through minus variables matching [`ENV_SECRET_DENYLIST`].
    Scrubbed,
    /// Start from an empty environment.
    Clear,
}

/// Env var name patterns that must not leak into helper processes.
///
/// Patterns support a leading and/or trailing `*`; see [`env_glob_matches`].
pub const ENV_SECRET_DENYLIST: &[&str] = &[
    "*_API_KEY",
    "*_TOKEN",
    "*_SECRET",
    "*_SECRET_*",
    "*_PASSWORD",
    "*_CREDENTIAL*",
    "AWS_*",
    "GITHUB_TOKEN",
];

/// Minimal glob matcher for env var denylist patterns.
/// Handles `*_SUFFIX`, `PREFIX_*`, `*_INFIX*`, and exact match.
/// Both pattern and key are compared in uppercase.
#[must_use]
pub fn env_glob_matches(pattern: &str, key_upper: &str) -> bool {
    let pat = pattern.to_uppercase();
    match (pat.starts_with('*'), pat.ends_with('*')) {
        (true, true) if pat.len() >= 2 => {
            let inner = &pat[1..pat.len() - 1];
            key_upper.contains(inner)
        }
        (true, true) => true,
        (true, false) => {
            let suffix = &pat[1..];
            key_upper.ends_with(suffix)
        }
        (false, true) => {
            let prefix = &pat[..pat.len() - 1];
            key_upper.starts_with(prefix)
        }
        (false, false) => key_upper == pat,
    }
}

/// Whether an environment variable name is secret-bearing.
#[must_use]
pub fn is_secret_env_key(key: &str) -> bool {
    let upper = key.to_uppercase();
    ENV_SECRET_DENYLIST
        .iter()
        .any(|pat| env_glob_matches(pat, &upper))
}

/// When the supervisor respawns a worker that exited.
///
/// The default restarts immediately and without limit. `max_restarts` caps
/// the number of automatic restarts over the supervisor's lifetime; `delay`
/// is waited before each restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RestartPolicy {
    pub max_restarts: Option<u32>,
    pub delay: Duration,
}

impl RestartPolicy {
    /// Restart immediately, forever.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Never restart; the first exit ends supervision.
    #[must_use]
    pub fn never() -> Self {
        Self {
            max_restarts: Some(0),
            delay: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn limited(max_restarts: u32) -> Self {
        Self {
            max_restarts: Some(max_restarts),
            delay: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Whether another restart is allowed after `restarts_so_far` restarts.
    #[must_use]
    pub fn allows_restart(&self, restarts_so_far: u32) -> bool {
        self.max_restarts.is_none_or(|max| restarts_so_far < max)
    }
}
