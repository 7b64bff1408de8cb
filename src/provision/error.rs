use std::path::PathBuf;

use thiserror::Error;

use crate::release::error::NetworkError;

/// Why a provisioning attempt produced no usable binary
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Custom server path not found: {}", path.display())]
    Configuration { path: PathBuf },

    #[error("Unsupported platform: {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("Could not reach the release feed and no cached server exists: {0}")]
    Network(#[from] NetworkError),

    #[error("Release has no asset {asset} for {target}")]
    AssetNotFound { asset: String, target: String },

    #[error("Failed to update the server cache: {0}")]
    Cache(#[from] std::io::Error),
}
