//! LSP protocol client for a supervised language server.
//!
//! [`LspClient`] speaks JSON-RPC over any async duplex stream. It is built by
//! the supervisor each time the worker process (re)spawns and is never reused
//! across workers.

pub mod codec;
pub mod types;

pub(crate) mod diagnostics;
pub(crate) mod protocol;

mod client;
mod error;

pub use client::LspClient;
pub use error::ClientError;
pub use types::{Diagnostic, DiagnosticSeverity, DiagnosticsSnapshot};
