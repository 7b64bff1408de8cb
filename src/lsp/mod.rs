// LSP client layer
// - transport.rs: Content-Length framing
// - client.rs: connection to codeowners-lsp (requests, notifications, server requests)
// - session.rs: start/stop/restart lifecycle and editor commands
// - error.rs: TransportError, SessionError

pub mod client;
pub mod error;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{LspClient, hover_text};
pub use error::{SessionError, TransportError};
pub use session::{ProcessLauncher, ServerLauncher, Session, SessionState};
