use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced to callers of [`LspClient`](crate::LspClient).
#[derive(Debug, Error)]
pub enum ClientError {
    /// The client was stopped, typically because the worker was replaced.
    #[error("client has been stopped")]
    Stopped,

    /// The transport went away (writer closed or reader ended) mid-exchange.
    #[error("connection to language server closed")]
    Closed,

    #[error("request '{method}' timed out after {secs}s")]
    Timeout { method: String, secs: u64 },

    /// The `initialize` exchange failed; the client is unusable.
    #[error("initialize handshake failed: {0}")]
    Handshake(String),

    #[error("server returned error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("JSON codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("cannot convert path to file URI: {}", .0.display())]
    Uri(PathBuf),
}

impl ClientError {
    /// Build from the `error` object of a JSON-RPC response.
    pub(crate) fn from_response_error(error: &serde_json::Value) -> Self {
        Self::Server {
            code: error["code"].as_i64().unwrap_or_default(),
            message: error["message"]
                .as_str()
                .unwrap_or("unknown error")
                .to_string(),
        }
    }
}
