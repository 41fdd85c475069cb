//! Supervision of a language-server worker process.
//!
//! A [`Supervisor`] lazily spawns the worker (by default `sourcekit-lsp`
//! through a login shell), binds one protocol client to its stdio and keeps
//! doing so across worker restarts. Interested parties [`subscribe`] and are
//! handed the current client immediately and every replacement after.
//!
//! [`subscribe`]: Supervisor::subscribe

mod binding;
mod client;
mod error;
mod launch;
mod supervisor;

pub use binding::Observer;
pub use client::{ClientFactory, LspClientFactory, ProtocolClient};
pub use error::SupervisorError;
pub use launch::{DEFAULT_SHELL, LaunchConfig, SOURCEKIT_COMMAND, SWIFT_LANGUAGE_ID, WorkerStdio};
pub use supervisor::Supervisor;
pub use swiftkit_types::{EnvPolicy, RestartPolicy, StderrMode, WorkerState};
