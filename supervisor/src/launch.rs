//! Worker launch configuration and spawning.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use swiftkit_types::{EnvPolicy, StderrMode, is_secret_env_key};

use crate::error::SupervisorError;

/// Shell used for login-shell launches unless configured otherwise.
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// Language server launched by [`LaunchConfig::sourcekit`].
pub const SOURCEKIT_COMMAND: &str = "sourcekit-lsp";

/// Language id registered on every client by [`LaunchConfig::sourcekit`].
pub const SWIFT_LANGUAGE_ID: &str = "swift";

/// How to start the worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: EnvPolicy,
    pub stderr: StderrMode,
    /// Language ids registered on each client bound to this worker.
    pub languages: Vec<String>,
}

impl LaunchConfig {
    /// Run `command_line` through `shell --login -c`.
    ///
    /// The worker binary usually lives on a PATH assembled by shell init files
    /// (toolchain managers, `swiftly`, Xcode selectors) that a bare exec would
    /// not see.
    #[must_use]
    pub fn login_shell(
        shell: impl Into<PathBuf>,
        command_line: impl Into<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: shell.into(),
            args: vec![
                "--login".to_string(),
                "-c".to_string(),
                command_line.into(),
            ],
            working_dir: working_dir.into(),
            env: EnvPolicy::Inherit,
            stderr: StderrMode::Null,
            languages: Vec::new(),
        }
    }

    /// Exec `program` directly. Bare names are resolved on our own PATH.
    #[must_use]
    pub fn direct(
        program: impl Into<PathBuf>,
        args: impl IntoIterator<Item = impl Into<String>>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            working_dir: working_dir.into(),
            env: EnvPolicy::Inherit,
            stderr: StderrMode::Null,
            languages: Vec::new(),
        }
    }

    /// `sourcekit-lsp` through the default login shell, rooted at the
    /// project, serving Swift. Stderr follows `DEV_MODE`, read now.
    #[must_use]
    pub fn sourcekit(project_root: impl Into<PathBuf>) -> Self {
        let dev_mode = std::env::var(StderrMode::DEV_MODE_VAR).ok();
        Self::login_shell(DEFAULT_SHELL, SOURCEKIT_COMMAND, project_root)
            .with_language(SWIFT_LANGUAGE_ID)
            .with_stderr(StderrMode::from_dev_mode(dev_mode.as_deref()))
    }

    #[must_use]
    pub fn with_language(mut self, language_id: impl Into<String>) -> Self {
        let language_id = language_id.into();
        if !self.languages.contains(&language_id) {
            self.languages.push(language_id);
        }
        self
    }

    #[must_use]
    pub fn with_env(mut self, env: EnvPolicy) -> Self {
        self.env = env;
        self
    }

    #[must_use]
    pub fn with_stderr(mut self, stderr: StderrMode) -> Self {
        self.stderr = stderr;
        self
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Program plus arguments, for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut out = self.program.display().to_string();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }

    fn resolve_program(&self) -> Result<PathBuf, SupervisorError> {
        if self.program.components().count() > 1 || self.program.is_absolute() {
            return Ok(self.program.clone());
        }
        which::which(&self.program).map_err(|e| SupervisorError::BinaryNotFound {
            program: self.program.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, e),
        })
    }

    pub(crate) fn command(&self) -> Result<Command, SupervisorError> {
        let mut cmd = Command::new(self.resolve_program()?);
        cmd.args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(match self.stderr {
                StderrMode::Inherit => Stdio::inherit(),
                StderrMode::Null => Stdio::null(),
            })
            .kill_on_drop(true);
        apply_env_policy(&mut cmd, self.env, std::env::vars_os().map(|(key, _)| key));
        Ok(cmd)
    }

    /// Spawn one worker.
    pub(crate) fn spawn(&self) -> Result<Child, SupervisorError> {
        let mut cmd = self.command()?;
        tracing::debug!(
            command = %self.describe(),
            cwd = %self.working_dir.display(),
            "Spawning worker"
        );
        cmd.spawn().map_err(|source| {
            let program = self.program.display().to_string();
            if source.kind() == std::io::ErrorKind::NotFound {
                SupervisorError::BinaryNotFound { program, source }
            } else {
                SupervisorError::Spawn { program, source }
            }
        })
    }
}

fn apply_env_policy(cmd: &mut Command, policy: EnvPolicy, keys: impl Iterator<Item = OsString>) {
    match policy {
        EnvPolicy::Inherit => {}
        EnvPolicy::Clear => {
            cmd.env_clear();
        }
        EnvPolicy::Scrubbed => {
            for key in keys {
                if key.to_str().is_some_and(is_secret_env_key) {
                    cmd.env_remove(&key);
                }
            }
        }
    }
}

/// The worker's stdio as one duplex stream: we write to its stdin and read
/// its stdout.
#[derive(Debug)]
pub struct WorkerStdio {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

impl WorkerStdio {
    pub(crate) fn take_from(child: &mut Child) -> Result<Self, SupervisorError> {
        let stdin = child
            .stdin
            .take()
            .ok_or(SupervisorError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SupervisorError::MissingPipe("stdout"))?;
        Ok(Self { stdin, stdout })
    }
}
