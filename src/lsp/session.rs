//! Lifecycle of the codeowners-lsp session owned by an editor integration
//!
//! A [`Session`] replaces a process-wide "current client": the host creates
//! one per workspace and hands it to its command handlers. Lifecycle
//! operations and commands are serialized on one lock, so a restart issued
//! while another is in flight waits for it instead of interleaving.

use std::sync::{Arc, Mutex, PoisonError};

use tower_lsp::lsp_types::{GotoDefinitionResponse, Location, Url};
use tracing::{debug, error, info, warn};

use crate::config::{ClientSettings, ExtensionConfig};
use crate::lsp::client::{LspClient, hover_text};
use crate::lsp::error::{SessionError, TransportError};
use crate::provision::{Provisioner, ResolvedBinary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Starting,
    Running,
    Stopping,
}

/// Turns a resolved binary into a connected (not yet initialized) client
#[async_trait::async_trait]
pub trait ServerLauncher: Send + Sync {
    async fn launch(
        &self,
        binary: &ResolvedBinary,
        settings: ClientSettings,
    ) -> Result<LspClient, TransportError>;
}

/// Runs the binary as a child process over stdio
pub struct ProcessLauncher;

#[async_trait::async_trait]
impl ServerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        binary: &ResolvedBinary,
        settings: ClientSettings,
    ) -> Result<LspClient, TransportError> {
        LspClient::spawn(&binary.path, settings)
    }
}

struct Inner {
    client: Option<LspClient>,
    settings: ClientSettings,
}

pub struct Session {
    provisioner: Arc<Provisioner>,
    launcher: Arc<dyn ServerLauncher>,
    workspace: Option<Url>,
    inner: tokio::sync::Mutex<Inner>,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(provisioner: Arc<Provisioner>, workspace: Option<Url>) -> Self {
        Self {
            provisioner,
            launcher: Arc::new(ProcessLauncher),
            workspace,
            inner: tokio::sync::Mutex::new(Inner {
                client: None,
                settings: ClientSettings::default(),
            }),
            state: Mutex::new(SessionState::NotStarted),
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ServerLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Current lifecycle state. A server that exited on its own reports
    /// `NotStarted`.
    pub fn state(&self) -> SessionState {
        let state = *self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state != SessionState::Running {
            return state;
        }

        match self.inner.try_lock() {
            Ok(inner) if inner.client.as_ref().is_none_or(LspClient::has_exited) => {
                SessionState::NotStarted
            }
            _ => state,
        }
    }

    /// Provisions the binary, launches it and completes the handshake.
    /// Does nothing if the server is already running.
    pub async fn start(&self, config: &ExtensionConfig) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        self.start_locked(&mut inner, config).await
    }

    /// Gracefully stops the server; a no-op when nothing is running
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        self.stop_locked(&mut inner).await;
    }

    /// Stops the server and starts it again, re-checking the binary first
    pub async fn restart(&self, config: &ExtensionConfig) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        info!("Restarting codeowners-lsp");
        self.stop_locked(&mut inner).await;
        self.start_locked(&mut inner, config).await
    }

    /// Recomputes the settings snapshot and pushes it to a running server
    pub async fn on_settings_changed(&self, config: &ExtensionConfig) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        inner.settings = config.settings();

        match inner.client.as_ref().filter(|client| !client.has_exited()) {
            Some(client) => {
                client
                    .did_change_configuration(inner.settings.clone())
                    .await?
            }
            None => debug!("Server not running, settings apply on next start"),
        }
        Ok(())
    }

    /// Ownership summary for a document, taken from the server's hover text
    pub async fn show_ownership(&self, document: &Url) -> Result<Option<String>, SessionError> {
        let inner = self.inner.lock().await;
        let client = running_client(&inner)?;

        let hover = client.hover(document.clone()).await?;
        Ok(hover
            .as_ref()
            .map(hover_text)
            .filter(|text| !text.trim().is_empty()))
    }

    /// CODEOWNERS rule matching a document
    pub async fn go_to_rule(&self, document: &Url) -> Result<Option<Location>, SessionError> {
        let inner = self.inner.lock().await;
        let client = running_client(&inner)?;

        let response = client.definition(document.clone()).await?;
        Ok(response.and_then(first_location))
    }

    async fn start_locked(
        &self,
        inner: &mut Inner,
        config: &ExtensionConfig,
    ) -> Result<(), SessionError> {
        if inner.client.as_ref().is_some_and(|client| !client.has_exited()) {
            debug!("codeowners-lsp already running");
            return Ok(());
        }
        if inner.client.take().is_some() {
            warn!("Discarding codeowners-lsp session that exited unexpectedly");
        }

        self.set_state(SessionState::Starting);
        inner.settings = config.settings();

        match self.launch(config, inner.settings.clone()).await {
            Ok(client) => {
                inner.client = Some(client);
                self.set_state(SessionState::Running);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start codeowners-lsp: {}", e);
                self.set_state(SessionState::NotStarted);
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        config: &ExtensionConfig,
        settings: ClientSettings,
    ) -> Result<LspClient, SessionError> {
        let binary = self.provisioner.ensure_binary(config).await?;
        let mut client = self.launcher.launch(&binary, settings).await?;
        client.initialize(self.workspace.clone()).await?;
        Ok(client)
    }

    async fn stop_locked(&self, inner: &mut Inner) {
        let Some(client) = inner.client.take() else {
            return;
        };

        self.set_state(SessionState::Stopping);
        if let Err(e) = client.shutdown().await {
            warn!("codeowners-lsp did not shut down cleanly: {}", e);
        }
        self.set_state(SessionState::NotStarted);
        info!("codeowners-lsp stopped");
    }

    fn set_state(&self, state: SessionState) {
        debug!("Session state -> {:?}", state);
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

fn running_client(inner: &Inner) -> Result<&LspClient, TransportError> {
    match &inner.client {
        Some(client) if !client.has_exited() => Ok(client),
        Some(_) => {
            error!("codeowners-lsp has exited; restart the server");
            Err(TransportError::Closed)
        }
        None => Err(TransportError::NotRunning),
    }
}

fn first_location(response: GotoDefinitionResponse) -> Option<Location> {
    match response {
        GotoDefinitionResponse::Scalar(location) => Some(location),
        GotoDefinitionResponse::Array(locations) => locations.into_iter().next(),
        GotoDefinitionResponse::Link(links) => links.into_iter().next().map(|link| Location {
            uri: link.target_uri,
            range: link.target_selection_range,
        }),
    }
}
