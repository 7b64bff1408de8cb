//! Scripted in-memory codeowners-lsp used by the client and session tests

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{BufReader, DuplexStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::config::ClientSettings;
use crate::lsp::client::LspClient;
use crate::lsp::transport::{read_message, write_message};

const WAIT: Duration = Duration::from_secs(5);

pub(crate) struct FakeServer {
    received: mpsc::UnboundedReceiver<Value>,
    writer: Arc<Mutex<DuplexStream>>,
    task: JoinHandle<()>,
}

impl FakeServer {
    /// Connects a client to a new fake server
    pub(crate) fn connect(settings: ClientSettings) -> (LspClient, FakeServer) {
        let (client_out, server_in) = tokio::io::duplex(64 * 1024);
        let (server_out, client_in) = tokio::io::duplex(64 * 1024);

        let client = LspClient::connect(client_in, client_out, settings);
        (client, Self::serve(server_in, server_out))
    }

    fn serve(reader: DuplexStream, writer: DuplexStream) -> Self {
        let writer = Arc::new(Mutex::new(writer));
        let (tx, received) = mpsc::unbounded_channel();

        let task_writer = Arc::clone(&writer);
        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            while let Ok(Some(message)) = read_message(&mut reader).await {
                let _ = tx.send(message.clone());

                let Some(method) = message.get("method").and_then(Value::as_str) else {
                    continue;
                };
                if method == "exit" {
                    break;
                }
                let Some(id) = message.get("id") else {
                    continue;
                };

                let reply = reply_to(id, method, &message["params"]);
                let mut writer = task_writer.lock().await;
                if write_message(&mut *writer, &reply).await.is_err() {
                    break;
                }
            }
        });

        Self {
            received,
            writer,
            task,
        }
    }

    /// Pushes a raw message to the client
    pub(crate) async fn send(&self, message: Value) {
        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, &message).await.unwrap();
    }

    /// Waits for the next client message with the given method
    pub(crate) async fn next_message(&mut self, method: &str) -> Value {
        self.next_matching(|message| message["method"] == method)
            .await
    }

    /// Waits for the client's response to a server request
    pub(crate) async fn next_response(&mut self, id: impl Into<Value>) -> Value {
        let id = id.into();
        self.next_matching(|message| message.get("method").is_none() && message["id"] == id)
            .await
    }

    /// Drops both ends of the connection
    pub(crate) async fn hang_up(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }

    async fn next_matching(&mut self, predicate: impl Fn(&Value) -> bool) -> Value {
        tokio::time::timeout(WAIT, async {
            loop {
                let message = self
                    .received
                    .recv()
                    .await
                    .expect("fake server stopped");
                if predicate(&message) {
                    return message;
                }
            }
        })
        .await
        .expect("timed out waiting for client message")
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn reply_to(id: &Value, method: &str, params: &Value) -> Value {
    if params["textDocument"]["uri"] == "file:///repo/fail" {
        return json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32603, "message": "internal error" },
        });
    }

    let result = match method {
        "initialize" => json!({
            "capabilities": { "hoverProvider": true, "definitionProvider": true },
            "serverInfo": { "name": "codeowners-lsp", "version": "1.2.3" },
        }),
        "textDocument/hover" => json!({
            "contents": { "kind": "markdown", "value": "Owned by @acme/platform" },
        }),
        "textDocument/definition" => json!({
            "uri": "file:///repo/.github/CODEOWNERS",
            "range": {
                "start": { "line": 4, "character": 0 },
                "end": { "line": 4, "character": 24 },
            },
        }),
        _ => Value::Null,
    };

    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// Polls `condition` until it holds, panicking after a few seconds
pub(crate) async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}
