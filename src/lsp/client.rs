//! JSON-RPC client for a single codeowners-lsp process over stdio

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_lsp::lsp_types::notification::{
    DidChangeConfiguration, Exit, Initialized, Notification,
};
use tower_lsp::lsp_types::request::{GotoDefinition, HoverRequest, Initialize, Request, Shutdown};
use tower_lsp::lsp_types::*;
use tracing::{debug, error, info, warn};

use crate::config::ClientSettings;
use crate::lsp::error::TransportError;
use crate::lsp::transport::{read_message, write_message};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// JSON-RPC "method not found"
const METHOD_NOT_FOUND: i64 = -32601;

type Pending = Arc<Mutex<HashMap<i64, oneshot::Sender<Result<Value, TransportError>>>>>;
type SharedWriter = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

pub struct LspClient {
    writer: SharedWriter,
    pending: Pending,
    settings: Arc<RwLock<ClientSettings>>,
    next_id: AtomicI64,
    exited: Arc<AtomicBool>,
    child: Option<Child>,
    reader_task: JoinHandle<()>,
    server_info: Option<ServerInfo>,
}

impl LspClient {
    /// Launches the server binary with piped stdio
    pub fn spawn(path: &Path, settings: ClientSettings) -> Result<Self, TransportError> {
        info!("Starting codeowners-lsp at {:?}", path);

        let mut child = Command::new(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TransportError::Spawn {
                path: path.to_path_buf(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(TransportError::NotRunning)?;
        let stdout = child.stdout.take().ok_or(TransportError::NotRunning)?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr));
        }

        let mut client = Self::connect(stdout, stdin, settings);
        client.child = Some(child);
        Ok(client)
    }

    /// Speaks the protocol over arbitrary byte streams
    pub fn connect<R, W>(reader: R, writer: W, settings: ClientSettings) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(Box::new(writer)));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let settings = Arc::new(RwLock::new(settings));
        let exited = Arc::new(AtomicBool::new(false));

        let reader_task = tokio::spawn(read_loop(
            BufReader::new(reader),
            Arc::clone(&writer),
            Arc::clone(&pending),
            Arc::clone(&settings),
            Arc::clone(&exited),
        ));

        Self {
            writer,
            pending,
            settings,
            next_id: AtomicI64::new(1),
            exited,
            child: None,
            reader_task,
            server_info: None,
        }
    }

    /// True once the server's output stream has closed
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    /// Performs the initialize / initialized handshake, passing the current
    /// settings snapshot as initialization options
    pub async fn initialize(
        &mut self,
        workspace: Option<Url>,
    ) -> Result<InitializeResult, TransportError> {
        let workspace_folders = workspace.map(|uri| {
            let name = uri
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .unwrap_or_default()
                .to_string();
            vec![WorkspaceFolder { uri, name }]
        });

        let params = InitializeParams {
            process_id: Some(std::process::id()),
            initialization_options: Some(self.current_settings().to_value()),
            capabilities: client_capabilities(),
            workspace_folders,
            client_info: Some(ClientInfo {
                name: "codeowners-client".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            ..Default::default()
        };

        let result = self.send_request::<Initialize>(params).await?;
        self.send_notification::<Initialized>(InitializedParams {})
            .await?;

        match &result.server_info {
            Some(info) => info!(
                "Connected to {} {}",
                info.name,
                info.version.as_deref().unwrap_or("(unknown version)")
            ),
            None => info!("Connected to server without server info"),
        }
        self.server_info = result.server_info.clone();

        Ok(result)
    }

    /// Hover at the start of the document
    pub async fn hover(&self, uri: Url) -> Result<Option<Hover>, TransportError> {
        let params = HoverParams {
            text_document_position_params: document_start(uri),
            work_done_progress_params: Default::default(),
        };
        self.send_request::<HoverRequest>(params).await
    }

    /// Definition lookup at the start of the document
    pub async fn definition(
        &self,
        uri: Url,
    ) -> Result<Option<GotoDefinitionResponse>, TransportError> {
        let params = GotoDefinitionParams {
            text_document_position_params: document_start(uri),
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };
        self.send_request::<GotoDefinition>(params).await
    }

    /// Replaces the settings snapshot and pushes it to the server
    pub async fn did_change_configuration(
        &self,
        settings: ClientSettings,
    ) -> Result<(), TransportError> {
        let value = settings.to_value();
        *self
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = settings;

        self.send_notification::<DidChangeConfiguration>(DidChangeConfigurationParams {
            settings: value,
        })
        .await
    }

    pub async fn send_request<R: Request>(
        &self,
        params: R::Params,
    ) -> Result<R::Result, TransportError> {
        let result = self.call(R::METHOD, serde_json::to_value(params)?).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn send_notification<N: Notification>(
        &self,
        params: N::Params,
    ) -> Result<(), TransportError> {
        let message = json!({
            "jsonrpc": "2.0",
            "method": N::METHOD,
            "params": serde_json::to_value(params)?,
        });
        self.send(&message).await
    }

    /// Sends shutdown + exit and reaps the process, killing it if it lingers
    pub async fn shutdown(mut self) -> Result<(), TransportError> {
        let result = if self.has_exited() {
            Ok(())
        } else {
            match self.send_request::<Shutdown>(()).await {
                Ok(()) => self.send_notification::<Exit>(()).await,
                Err(e) => Err(e),
            }
        };

        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(EXIT_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => debug!("codeowners-lsp exited with {}", status),
                Ok(Err(e)) => warn!("Failed to wait for codeowners-lsp: {}", e),
                Err(_) => {
                    warn!("codeowners-lsp did not exit in time, killing it");
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill codeowners-lsp: {}", e);
                    }
                }
            }
        }

        result
    }

    fn current_settings(&self) -> ClientSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        if self.has_exited() {
            return Err(TransportError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        // The reader may have drained pending requests just before the insert
        if self.has_exited() {
            lock(&self.pending).remove(&id);
            return Err(TransportError::Closed);
        }

        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(e) = self.send(&message).await {
            lock(&self.pending).remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(TransportError::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    async fn send(&self, message: &Value) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, message).await
    }
}

impl Drop for LspClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Text of a hover response, with multiple sections separated by blank lines
pub fn hover_text(hover: &Hover) -> String {
    fn marked(value: &MarkedString) -> &str {
        match value {
            MarkedString::String(text) => text,
            MarkedString::LanguageString(code) => &code.value,
        }
    }

    match &hover.contents {
        HoverContents::Scalar(value) => marked(value).to_string(),
        HoverContents::Array(values) => values
            .iter()
            .map(marked)
            .collect::<Vec<_>>()
            .join("\n\n"),
        HoverContents::Markup(markup) => markup.value.clone(),
    }
}

fn client_capabilities() -> ClientCapabilities {
    ClientCapabilities {
        workspace: Some(WorkspaceClientCapabilities {
            configuration: Some(true),
            ..Default::default()
        }),
        text_document: Some(TextDocumentClientCapabilities {
            hover: Some(HoverClientCapabilities {
                content_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
                ..Default::default()
            }),
            definition: Some(GotoCapability::default()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn document_start(uri: Url) -> TextDocumentPositionParams {
    TextDocumentPositionParams {
        text_document: TextDocumentIdentifier { uri },
        position: Position::new(0, 0),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn read_loop<R>(
    mut reader: BufReader<R>,
    writer: SharedWriter,
    pending: Pending,
    settings: Arc<RwLock<ClientSettings>>,
    exited: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let _closed = MarkClosed {
        exited,
        pending: Arc::clone(&pending),
    };

    loop {
        match read_message(&mut reader).await {
            Ok(Some(message)) => dispatch(message, &writer, &pending, &settings).await,
            Ok(None) => {
                error!("codeowners-lsp closed its output stream");
                break;
            }
            Err(e) => {
                error!("Failed to read from codeowners-lsp: {}", e);
                break;
            }
        }
    }
}

/// Marks the connection closed and fails every waiting request once the
/// reader stops, including when it panics or is aborted
struct MarkClosed {
    exited: Arc<AtomicBool>,
    pending: Pending,
}

impl Drop for MarkClosed {
    fn drop(&mut self) {
        self.exited.store(true, Ordering::SeqCst);
        let waiting: Vec<_> = lock(&self.pending).drain().map(|(_, tx)| tx).collect();
        for tx in waiting {
            let _ = tx.send(Err(TransportError::Closed));
        }
    }
}

async fn dispatch(
    message: Value,
    writer: &SharedWriter,
    pending: &Pending,
    settings: &RwLock<ClientSettings>,
) {
    let method = message.get("method").and_then(Value::as_str);
    let id = message.get("id").filter(|id| !id.is_null());

    match (method, id) {
        (Some(method), Some(id)) => {
            let reply = {
                let settings = settings.read().unwrap_or_else(PoisonError::into_inner);
                server_request_reply(id, method, message.get("params"), &settings)
            };
            let mut writer = writer.lock().await;
            if let Err(e) = write_message(&mut *writer, &reply).await {
                warn!("Failed to answer {} request: {}", method, e);
            }
        }
        (Some(method), None) => handle_notification(method, message.get("params")),
        (None, Some(id)) => {
            let Some(tx) = id.as_i64().and_then(|id| lock(pending).remove(&id)) else {
                warn!("Response for unknown request id {}", id);
                return;
            };
            let _ = tx.send(response_result(&message));
        }
        (None, None) => warn!("Ignoring message without method or id"),
    }
}

fn response_result(message: &Value) -> Result<Value, TransportError> {
    if let Some(error) = message.get("error") {
        return Err(TransportError::Rpc {
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }

    Ok(message.get("result").cloned().unwrap_or(Value::Null))
}

/// Builds the reply to a request initiated by the server
fn server_request_reply(
    id: &Value,
    method: &str,
    params: Option<&Value>,
    settings: &ClientSettings,
) -> Value {
    debug!("Server request {}", method);

    match method {
        "workspace/configuration" => {
            let items = params
                .and_then(|p| p.get("items"))
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": vec![settings.to_value(); items],
            })
        }
        "client/registerCapability"
        | "client/unregisterCapability"
        | "window/workDoneProgress/create" => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": null,
        }),
        _ => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": METHOD_NOT_FOUND,
                "message": format!("Unhandled method {}", method),
            },
        }),
    }
}

fn handle_notification(method: &str, params: Option<&Value>) {
    match method {
        "window/logMessage" | "window/showMessage" => {
            let Some(params) = params else { return };
            let text = params
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            match params.get("type").and_then(Value::as_i64) {
                Some(1) => error!(target: "codeowners_lsp", "{}", text),
                Some(2) => warn!(target: "codeowners_lsp", "{}", text),
                Some(3) => info!(target: "codeowners_lsp", "{}", text),
                _ => debug!(target: "codeowners_lsp", "{}", text),
            }
        }
        "textDocument/publishDiagnostics" => {
            let count = params
                .and_then(|p| p.get("diagnostics"))
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            debug!("Server published {} diagnostics", count);
        }
        _ => debug!("Ignoring notification {}", method),
    }
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(target: "codeowners_lsp", "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading codeowners-lsp stderr: {}", e);
                break;
            }
        }
    }
}
