use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Returns the path to the data directory for codeowners-client.
/// Uses $XDG_DATA_HOME/codeowners-client if XDG_DATA_HOME is set,
/// otherwise falls back to ~/.local/share/codeowners-client,
/// or ./codeowners-client if neither is available.
pub fn data_dir() -> PathBuf {
    data_dir_with_env(std::env::var("XDG_DATA_HOME").ok(), dirs::home_dir())
}

/// Returns the default storage root holding the downloaded server binary.
pub fn storage_dir() -> PathBuf {
    data_dir().join("server")
}

/// Returns the path to the log file.
pub fn log_path() -> PathBuf {
    data_dir().join("codeowners-client.log")
}

fn data_dir_with_env(xdg_data_home: Option<String>, home_dir: Option<PathBuf>) -> PathBuf {
    let data_dir = xdg_data_home
        .map(PathBuf::from)
        .or_else(|| home_dir.map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));

    data_dir.join("codeowners-client")
}

/// Diagnostic categories reported by codeowners-lsp whose severity can be overridden
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiagnosticKind {
    InvalidPattern,
    InvalidOwner,
    PatternNoMatch,
    DuplicateOwner,
    ShadowedRule,
    NoOwners,
    UnownedFiles,
    GithubOwnerNotFound,
    FileNotOwned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
    Hint,
    Off,
}

/// Editor-side configuration as provided by the host.
///
/// Every recognized option is listed here; an absent field means the server
/// falls back to its own default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExtensionConfig {
    /// Custom location of the codeowners-lsp executable
    pub server_path: Option<String>,
    /// Custom location of the CODEOWNERS file
    pub codeowners_path: Option<String>,
    /// Owner identity used for "my files" features (e.g. "@octocat")
    pub individual: Option<String>,
    /// Team identity used for "my team's files" features (e.g. "@org/team")
    pub team: Option<String>,
    pub github_token: Option<String>,
    pub validate_owners: Option<bool>,
    #[serde(default)]
    pub diagnostics: BTreeMap<DiagnosticKind, Severity>,
}

impl ExtensionConfig {
    /// Loads the configuration from a JSON settings file.
    /// A missing file yields the default configuration.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            debug!("Settings file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Custom server path, if one is configured and non-blank
    pub fn custom_server_path(&self) -> Option<&str> {
        non_empty(self.server_path.as_deref())
    }

    /// Builds the flattened settings snapshot sent to the server
    pub fn settings(&self) -> ClientSettings {
        let mut map = Map::new();

        let strings = [
            ("path", self.codeowners_path.as_deref()),
            ("individual", self.individual.as_deref()),
            ("team", self.team.as_deref()),
            ("github_token", self.github_token.as_deref()),
        ];
        for (key, value) in strings {
            if let Some(value) = non_empty(value) {
                map.insert(key.to_string(), Value::String(value.to_string()));
            }
        }

        if let Some(validate) = self.validate_owners {
            map.insert("validate_owners".to_string(), Value::Bool(validate));
        }

        if !self.diagnostics.is_empty() {
            let diagnostics = self
                .diagnostics
                .iter()
                .filter_map(|(kind, severity)| {
                    Some((
                        serde_json::to_value(kind).ok()?.as_str()?.to_string(),
                        serde_json::to_value(severity).ok()?,
                    ))
                })
                .collect::<Map<_, _>>();
            map.insert("diagnostics".to_string(), Value::Object(diagnostics));
        }

        ClientSettings(map)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Snapshot of the settings handed to codeowners-lsp, containing only options
/// that were explicitly set
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ClientSettings(Map<String, Value>);

impl ClientSettings {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl From<Map<String, Value>> for ClientSettings {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
