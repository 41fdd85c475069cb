//! Seams between the supervisor and the protocol client it binds.

use std::path::PathBuf;

use swiftkit_lsp::LspClient;

use crate::launch::WorkerStdio;

/// What the supervisor needs from a bound client.
pub trait ProtocolClient: Send + Sync + 'static {
    /// Register a language id this client serves.
    fn add_language(&self, language_id: &str);

    /// Begin the protocol session. Called once, after languages are added.
    fn start(&self);

    /// End the session. Idempotent.
    fn stop(&self);
}

/// Builds a client over a freshly spawned worker's stdio.
pub trait ClientFactory: Send + Sync + 'static {
    type Client: ProtocolClient;

    fn create(&self, stdio: WorkerStdio) -> Self::Client;
}

impl ProtocolClient for LspClient {
    fn add_language(&self, language_id: &str) {
        LspClient::add_language(self, language_id);
    }

    fn start(&self) {
        LspClient::start(self);
    }

    fn stop(&self) {
        LspClient::stop(self);
    }
}

/// Binds an [`LspClient`] rooted at the project directory.
#[derive(Debug, Clone)]
pub struct LspClientFactory {
    workspace_root: PathBuf,
}

impl LspClientFactory {
    #[must_use]
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }
}

impl ClientFactory for LspClientFactory {
    type Client = LspClient;

    fn create(&self, stdio: WorkerStdio) -> LspClient {
        LspClient::new(stdio.stdout, stdio.stdin, self.workspace_root.clone())
    }
}
