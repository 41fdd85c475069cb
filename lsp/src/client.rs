//! Protocol client: speaks LSP over one duplex byte stream.
//!
//! An [`LspClient`] is built over a reader/writer pair (normally a worker's
//! stdout/stdin) and does nothing until [`LspClient::start`]. Starting spawns
//! a writer task, a reader task and a handshake task; public requests wait for
//! the `initialize` exchange before touching the wire. [`LspClient::stop`]
//! retires the client for good: a stopped client is never restarted, the
//! owner builds a new one instead.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::codec::{FrameReader, FrameWriter};
use crate::diagnostics::DiagnosticsStore;
use crate::error::ClientError;
use crate::protocol::{self, Incoming, Notification, PublishDiagnosticsParams, Request};
use crate::types::{Diagnostic, DiagnosticsSnapshot};

const INIT_TIMEOUT_SECS: u64 = 30;

const REQUEST_TIMEOUT_SECS: u64 = 30;

const WRITER_CHANNEL_CAPACITY: usize = 64;

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum WriterCommand {
    Send(serde_json::Value),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Handshake {
    Pending,
    Ready,
    Failed(String),
    Stopped,
}

enum Lifecycle {
    Idle {
        reader: BoxReader,
        writer: BoxWriter,
        writer_rx: mpsc::Receiver<WriterCommand>,
    },
    Running {
        reader_handle: JoinHandle<()>,
        writer_handle: JoinHandle<()>,
        handshake_handle: JoinHandle<()>,
    },
    Stopped,
}

/// Request/notification plumbing shared by the client and its handshake task.
#[derive(Clone)]
struct RpcChannel {
    writer_tx: mpsc::Sender<WriterCommand>,
    pending: PendingMap,
    next_id: Arc<AtomicU64>,
}

impl RpcChannel {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_value(Request::new(id, method, params))?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        if self
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .is_err()
        {
            lock(&self.pending).remove(&id);
            return Err(ClientError::Closed);
        }

        let body = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(body)) => body,
            Ok(Err(_)) => {
                lock(&self.pending).remove(&id);
                return Err(ClientError::Closed);
            }
            Err(_) => {
                lock(&self.pending).remove(&id);
                return Err(ClientError::Timeout {
                    method: method.to_string(),
                    secs: timeout.as_secs(),
                });
            }
        };

        if let Some(error) = body.get("error") {
            return Err(ClientError::from_response_error(error));
        }
        Ok(body
            .get("result")
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), ClientError> {
        let frame = serde_json::to_value(Notification::new(method, params))?;
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Queue a frame without waiting; used on the synchronous stop path.
    fn try_enqueue(&self, frame: serde_json::Value) {
        let _ = self.writer_tx.try_send(WriterCommand::Send(frame));
    }
}

/// Everything the reader task needs to route incoming frames.
struct Dispatch {
    pending: PendingMap,
    writer_tx: mpsc::Sender<WriterCommand>,
    diagnostics: Arc<Mutex<DiagnosticsStore>>,
    workspace_root: PathBuf,
}

impl Dispatch {
    async fn frame(&self, frame: &serde_json::Value) {
        let Some(incoming) = protocol::classify(frame) else {
            tracing::trace!("Ignoring malformed JSON-RPC frame");
            return;
        };

        match incoming {
            Incoming::Response { id, body } => {
                let sender = lock(&self.pending).remove(&id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(body);
                    }
                    None => tracing::trace!(id, "Dropping response for unknown request"),
                }
            }
            Incoming::ServerRequest { id, method } => {
                // Servers block on unanswered requests (registerCapability,
                // workspace/configuration, ...).
                tracing::debug!("Language server sent request: {method}; replying method not found");
                let reply = protocol::method_not_found(&id, &method);
                let _ = self.writer_tx.send(WriterCommand::Send(reply)).await;
            }
            Incoming::Notification { method, params } => self.notification(&method, params),
        }
    }

    fn notification(&self, method: &str, params: Option<serde_json::Value>) {
        match method {
            "textDocument/publishDiagnostics" => {
                let Some(params) = params else { return };
                let params = match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                    Ok(params) => params,
                    Err(e) => {
                        tracing::debug!("Failed to parse publishDiagnostics: {e}");
                        return;
                    }
                };
                let Some(path) = protocol::file_uri_to_path(&params.uri) else {
                    return;
                };
                let path = protocol::normalize_path(&path);
                if !path.starts_with(&self.workspace_root) {
                    tracing::warn!(
                        "Language server reported diagnostics outside workspace: {}",
                        path.display()
                    );
                    return;
                }
                let items = params
                    .diagnostics
                    .iter()
                    .map(protocol::LspDiagnostic::to_diagnostic)
                    .collect();
                lock(&self.diagnostics).update(path, items);
            }
            "window/logMessage" | "window/showMessage" => {
                let message = params
                    .as_ref()
                    .and_then(|p| p.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or_default();
                tracing::debug!(target: "swiftkit_lsp::server", "{message}");
            }
            _ => tracing::trace!("Ignoring notification: {method}"),
        }
    }
}

/// An LSP client bound to one duplex stream.
pub struct LspClient {
    workspace_root: PathBuf,
    languages: Mutex<Vec<String>>,
    lifecycle: Mutex<Lifecycle>,
    channel: RpcChannel,
    handshake: Arc<watch::Sender<Handshake>>,
    /// Open documents and the last version sent for each.
    documents: tokio::sync::Mutex<HashMap<String, i32>>,
    diagnostics: Arc<Mutex<DiagnosticsStore>>,
}

impl LspClient {
    /// Wrap a duplex stream. Nothing is read or written until [`start`](Self::start).
    pub fn new<R, W>(reader: R, writer: W, workspace_root: impl Into<PathBuf>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
        let (handshake, _) = watch::channel(Handshake::Pending);
        Self {
            workspace_root: protocol::normalize_path(&workspace_root.into()),
            languages: Mutex::new(Vec::new()),
            lifecycle: Mutex::new(Lifecycle::Idle {
                reader: Box::new(reader),
                writer: Box::new(writer),
                writer_rx,
            }),
            channel: RpcChannel {
                writer_tx,
                pending: Arc::new(Mutex::new(HashMap::new())),
                next_id: Arc::new(AtomicU64::new(1)),
            },
            handshake: Arc::new(handshake),
            documents: tokio::sync::Mutex::new(HashMap::new()),
            diagnostics: Arc::new(Mutex::new(DiagnosticsStore::default())),
        }
    }

    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Register a language id this client serves. Duplicates are ignored.
    pub fn add_language(&self, language_id: &str) {
        let mut languages = lock(&self.languages);
        if !languages.iter().any(|l| l == language_id) {
            languages.push(language_id.to_string());
        }
    }

    #[must_use]
    pub fn languages(&self) -> Vec<String> {
        lock(&self.languages).clone()
    }

    /// Begin the read/write loops and the `initialize` handshake.
    ///
    /// Must be called within a tokio runtime. Calling it again, or after
    /// [`stop`](Self::stop), does nothing.
    pub fn start(&self) {
        let mut lifecycle = lock(&self.lifecycle);
        let (reader, writer, writer_rx) =
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Idle {
                    reader,
                    writer,
                    writer_rx,
                } => (reader, writer, writer_rx),
                other => {
                    *lifecycle = other;
                    tracing::debug!("LSP client already started or stopped; ignoring start()");
                    return;
                }
            };

        let writer_handle = tokio::spawn(write_loop(writer, writer_rx));

        let dispatch = Dispatch {
            pending: self.channel.pending.clone(),
            writer_tx: self.channel.writer_tx.clone(),
            diagnostics: self.diagnostics.clone(),
            workspace_root: self.workspace_root.clone(),
        };
        let reader_handle = tokio::spawn(read_loop(reader, dispatch));

        let handshake_handle = tokio::spawn(run_handshake(
            self.channel.clone(),
            self.handshake.clone(),
            self.workspace_root.clone(),
        ));

        *lifecycle = Lifecycle::Running {
            reader_handle,
            writer_handle,
            handshake_handle,
        };
    }

    /// Retire the client: say goodbye to the server if the pipe is still
    /// open, then tear down the loops. Pending and future requests fail.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *lock(&self.lifecycle), Lifecycle::Stopped);
        match previous {
            Lifecycle::Running {
                reader_handle,
                writer_handle: _,
                handshake_handle,
            } => {
                handshake_handle.abort();
                let id = self.channel.next_id.fetch_add(1, Ordering::Relaxed);
                if let Ok(frame) = serde_json::to_value(Request::new(id, "shutdown", None)) {
                    self.channel.try_enqueue(frame);
                }
                if let Ok(frame) = serde_json::to_value(Notification::new("exit", None)) {
                    self.channel.try_enqueue(frame);
                }
                // The writer drains what is queued and then exits on its own.
                let _ = self.channel.writer_tx.try_send(WriterCommand::Shutdown);
                reader_handle.abort();
            }
            Lifecycle::Idle { .. } => {}
            Lifecycle::Stopped => return,
        }
        self.handshake.send_replace(Handshake::Stopped);
        lock(&self.channel.pending).clear();
        tracing::debug!("LSP client stopped");
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        matches!(*lock(&self.lifecycle), Lifecycle::Stopped)
    }

    /// Wait until the `initialize` exchange has completed.
    pub async fn ready(&self) -> Result<(), ClientError> {
        let mut rx = self.handshake.subscribe();
        let waited = tokio::time::timeout(
            Duration::from_secs(INIT_TIMEOUT_SECS),
            rx.wait_for(|h| *h != Handshake::Pending),
        )
        .await;

        match waited {
            Err(_) => Err(ClientError::Timeout {
                method: "initialize".to_string(),
                secs: INIT_TIMEOUT_SECS,
            }),
            Ok(Err(_)) => Err(ClientError::Closed),
            Ok(Ok(state)) => match &*state {
                Handshake::Ready => Ok(()),
                Handshake::Failed(reason) => Err(ClientError::Handshake(reason.clone())),
                Handshake::Stopped => Err(ClientError::Stopped),
                Handshake::Pending => Err(ClientError::Closed),
            },
        }
    }

    /// Send a request and wait for its result.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ClientError> {
        self.ready().await?;
        self.channel
            .request(method, params, Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .await
    }

    /// Send a notification.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), ClientError> {
        self.ready().await?;
        self.channel.notify(method, params).await
    }

    /// Push the full text of a document: `didOpen` the first time, then
    /// `didChange` with a strictly increasing version.
    pub async fn sync_document(&self, path: &Path, text: &str) -> Result<(), ClientError> {
        let uri = Self::uri_for(path)?;
        self.ready().await?;

        let mut documents = self.documents.lock().await;
        if let Some(version) = documents.get_mut(&uri) {
            *version += 1;
            let params = protocol::did_change_params(&uri, *version, text);
            self.channel
                .notify("textDocument/didChange", Some(params))
                .await
        } else {
            let language_id = self.language_for(path);
            documents.insert(uri.clone(), 1);
            let params = protocol::did_open_params(&uri, &language_id, 1, text);
            self.channel
                .notify("textDocument/didOpen", Some(params))
                .await
        }
    }

    /// `textDocument/hover` at a 0-indexed position. `None` when the server has nothing.
    pub async fn hover(
        &self,
        path: &Path,
        line: u32,
        character: u32,
    ) -> Result<Option<serde_json::Value>, ClientError> {
        self.position_request("textDocument/hover", path, line, character)
            .await
    }

    /// `textDocument/completion` at a 0-indexed position.
    pub async fn completion(
        &self,
        path: &Path,
        line: u32,
        character: u32,
    ) -> Result<Option<serde_json::Value>, ClientError> {
        self.position_request("textDocument/completion", path, line, character)
            .await
    }

    /// `textDocument/definition` at a 0-indexed position.
    pub async fn definition(
        &self,
        path: &Path,
        line: u32,
        character: u32,
    ) -> Result<Option<serde_json::Value>, ClientError> {
        self.position_request("textDocument/definition", path, line, character)
            .await
    }

    async fn position_request(
        &self,
        method: &str,
        path: &Path,
        line: u32,
        character: u32,
    ) -> Result<Option<serde_json::Value>, ClientError> {
        let uri = Self::uri_for(path)?;
        let params = protocol::position_params(&uri, line, character);
        let result = self.request(method, Some(params)).await?;
        Ok((!result.is_null()).then_some(result))
    }

    /// Snapshot of everything the server has published so far.
    #[must_use]
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        lock(&self.diagnostics).snapshot()
    }

    /// Error-level diagnostics for the given files only.
    #[must_use]
    pub fn errors_for_files(&self, paths: &[PathBuf]) -> Vec<(PathBuf, Vec<Diagnostic>)> {
        lock(&self.diagnostics).errors_for_files(paths)
    }

    fn uri_for(path: &Path) -> Result<String, ClientError> {
        protocol::path_to_file_uri(path)
            .map(|u| u.to_string())
            .ok_or_else(|| ClientError::Uri(path.to_path_buf()))
    }

    /// The registered language named like the file extension, else the first one.
    fn language_for(&self, path: &Path) -> String {
        let languages = lock(&self.languages);
        let ext = path.extension().and_then(|e| e.to_str());
        ext.and_then(|ext| languages.iter().find(|l| l.as_str() == ext))
            .or_else(|| languages.first())
            .cloned()
            .unwrap_or_else(|| "plaintext".to_string())
    }
}

impl Drop for LspClient {
    fn drop(&mut self) {
        if let Lifecycle::Running {
            reader_handle,
            writer_handle,
            handshake_handle,
        } = std::mem::replace(&mut *lock(&self.lifecycle), Lifecycle::Stopped)
        {
            handshake_handle.abort();
            reader_handle.abort();
            writer_handle.abort();
        }
    }
}

impl std::fmt::Debug for LspClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match *lock(&self.lifecycle) {
            Lifecycle::Idle { .. } => "idle",
            Lifecycle::Running { .. } => "running",
            Lifecycle::Stopped => "stopped",
        };
        f.debug_struct("LspClient")
            .field("workspace_root", &self.workspace_root)
            .field("languages", &*lock(&self.languages))
            .field("state", &state)
            .finish_non_exhaustive()
    }
}

async fn write_loop(writer: BoxWriter, mut writer_rx: mpsc::Receiver<WriterCommand>) {
    let mut writer = FrameWriter::new(writer);
    while let Some(cmd) = writer_rx.recv().await {
        match cmd {
            WriterCommand::Send(frame) => {
                if let Err(e) = writer.write_frame(&frame).await {
                    tracing::warn!("LSP write error: {e}");
                    break;
                }
            }
            WriterCommand::Shutdown => break,
        }
    }
}

async fn read_loop(reader: BoxReader, dispatch: Dispatch) {
    let mut reader = FrameReader::new(reader);
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => dispatch.frame(&frame).await,
            Ok(None) => {
                tracing::info!("Language server closed stdout");
                break;
            }
            Err(e) => {
                tracing::warn!("LSP reader error: {e}");
                break;
            }
        }
    }
    // Fail in-flight requests now instead of at their timeout, and let the
    // writer exit so later sends see a closed channel.
    lock(&dispatch.pending).clear();
    let _ = dispatch.writer_tx.send(WriterCommand::Shutdown).await;
}

async fn run_handshake(
    channel: RpcChannel,
    handshake: Arc<watch::Sender<Handshake>>,
    workspace_root: PathBuf,
) {
    let Some(root_uri) = protocol::path_to_file_uri(&workspace_root) else {
        handshake.send_replace(Handshake::Failed(format!(
            "cannot convert workspace root to URI: {}",
            workspace_root.display()
        )));
        return;
    };

    let params = protocol::initialize_params(root_uri.as_str());
    let outcome = match channel
        .request(
            "initialize",
            Some(params),
            Duration::from_secs(INIT_TIMEOUT_SECS),
        )
        .await
    {
        Ok(_) => channel
            .notify("initialized", Some(serde_json::json!({})))
            .await
            .map_or_else(
                |e| Handshake::Failed(e.to_string()),
                |()| Handshake::Ready,
            ),
        Err(e) => Handshake::Failed(e.to_string()),
    };

    match &outcome {
        Handshake::Ready => tracing::info!("LSP client initialized"),
        Handshake::Failed(reason) => tracing::warn!("LSP initialize failed: {reason}"),
        Handshake::Pending | Handshake::Stopped => {}
    }
    // A concurrent stop() wins over a late handshake result.
    handshake.send_if_modified(|state| {
        if *state == Handshake::Pending {
            *state = outcome;
            true
        } else {
            false
        }
    });
}
