//! `~/.swiftkit/config.toml` loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use swiftkit_supervisor::{DEFAULT_SHELL, LaunchConfig, SOURCEKIT_COMMAND, SWIFT_LANGUAGE_ID};
use swiftkit_types::{EnvPolicy, RestartPolicy, StderrMode};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwiftkitConfig {
    pub worker: Option<WorkerConfig>,
    pub restart: Option<RestartConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Command line for the language server. `${VAR}` is expanded.
    pub command: Option<String>,
    pub shell: Option<String>,
    /// Run `command` through `shell --login -c` (default) or exec it directly.
    pub login_shell: Option<bool>,
    /// Extra arguments; only used when `login_shell = false`.
    pub args: Option<Vec<String>>,
    pub languages: Option<Vec<String>>,
    pub env: Option<EnvPolicy>,
    /// Overrides `DEV_MODE` when set.
    pub stderr: Option<StderrMode>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestartConfig {
    /// Omit for unlimited restarts.
    pub max_restarts: Option<u32>,
    pub delay_ms: Option<u64>,
}

/// Replace `${VAR}` with the value of `VAR`, or nothing when unset.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    expand_with(value, |var| std::env::var(var).ok())
}

fn expand_with(value: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find('}') else {
            // Unterminated: keep the remainder verbatim.
            out.push_str(&rest[open..]);
            return out;
        };
        let var = &after[..close];
        if !var.is_empty()
            && let Some(replacement) = lookup(var)
        {
            out.push_str(&replacement);
        }
        rest = &after[close + 1..];
    }

    out.push_str(rest);
    out
}

impl SwiftkitConfig {
    /// Load from the default location. A missing file yields defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => {
                tracing::debug!("No home directory; using default config");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    /// Launch settings for a project rooted at `project_root`, reading
    /// `DEV_MODE` now.
    #[must_use]
    pub fn launch_config(&self, project_root: &Path) -> LaunchConfig {
        let dev_mode = std::env::var(StderrMode::DEV_MODE_VAR).ok();
        self.launch_config_with(project_root, dev_mode.as_deref(), |var| {
            std::env::var(var).ok()
        })
    }

    fn launch_config_with(
        &self,
        project_root: &Path,
        dev_mode: Option<&str>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> LaunchConfig {
        let worker = self.worker.as_ref();
        let command = worker
            .and_then(|w| w.command.as_deref())
            .map_or_else(|| SOURCEKIT_COMMAND.to_string(), |c| expand_with(c, &lookup));

        let mut launch = if worker.and_then(|w| w.login_shell).unwrap_or(true) {
            let shell = worker
                .and_then(|w| w.shell.as_deref())
                .map_or_else(|| DEFAULT_SHELL.to_string(), |s| expand_with(s, &lookup));
            LaunchConfig::login_shell(shell, command, project_root)
        } else {
            let args: Vec<String> = worker
                .and_then(|w| w.args.as_ref())
                .map(|args| args.iter().map(|a| expand_with(a, &lookup)).collect())
                .unwrap_or_default();
            LaunchConfig::direct(command, args, project_root)
        };

        let languages = worker
            .and_then(|w| w.languages.clone())
            .unwrap_or_else(|| vec![SWIFT_LANGUAGE_ID.to_string()]);
        for language in languages {
            launch = launch.with_language(language);
        }

        launch
            .with_env(worker.and_then(|w| w.env).unwrap_or_default())
            .with_stderr(
                worker
                    .and_then(|w| w.stderr)
                    .unwrap_or_else(|| StderrMode::from_dev_mode(dev_mode)),
            )
    }

    #[must_use]
    pub fn restart_policy(&self) -> RestartPolicy {
        let Some(restart) = &self.restart else {
            return RestartPolicy::default();
        };
        RestartPolicy {
            max_restarts: restart.max_restarts,
            delay: Duration::from_millis(restart.delay_ms.unwrap_or(0)),
        }
    }
}

fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".swiftkit").join("config.toml"))
}
