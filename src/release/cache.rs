use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::platform::PlatformTarget;
use crate::release::types::BINARY_NAME;

const VERSION_FILE: &str = "version";

/// Per-user store for the downloaded server binary and its version sidecar
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    exe_suffix: &'static str,
}

/// A download in progress, written to a temporary file beside the cached binary.
/// Dropping it without [`CacheStore::commit`] removes the temporary file.
#[derive(Debug)]
pub struct StagedBinary {
    file: File,
    path: TempPath,
}

impl StagedBinary {
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CacheStore {
    pub fn new(storage_root: impl Into<PathBuf>, platform: &PlatformTarget) -> Self {
        Self {
            root: storage_root.into(),
            exe_suffix: platform.exe_suffix(),
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.root
    }

    pub fn binary_path(&self) -> PathBuf {
        self.root.join(format!("{}{}", BINARY_NAME, self.exe_suffix))
    }

    pub fn version_path(&self) -> PathBuf {
        self.root.join(VERSION_FILE)
    }

    /// Returns the recorded version, but only when both the sidecar and the
    /// binary are present
    pub fn read_cached_version(&self) -> Option<String> {
        if !self.binary_path().is_file() {
            return None;
        }

        let version = std::fs::read_to_string(self.version_path()).ok()?;
        let version = version.trim();
        if version.is_empty() {
            return None;
        }

        Some(version.to_string())
    }

    /// Opens a temporary file in the storage directory for a new download
    pub fn stage(&self) -> io::Result<StagedBinary> {
        std::fs::create_dir_all(&self.root)?;

        let (file, path) = tempfile::Builder::new()
            .prefix(&format!(".{}-", BINARY_NAME))
            .suffix(".part")
            .tempfile_in(&self.root)?
            .into_parts();

        debug!("Staging download at {:?}", path);
        Ok(StagedBinary {
            file: File::from_std(file),
            path,
        })
    }

    /// Moves a completed download into place and records its version.
    ///
    /// The old sidecar is removed before the binary is swapped and the new one
    /// is written last, so an interrupted commit leaves either the previous
    /// pair or no cache at all.
    pub async fn commit(&self, staged: StagedBinary, version: &str) -> io::Result<PathBuf> {
        let StagedBinary { mut file, path } = staged;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        set_executable(&path).await?;

        let version_path = self.version_path();
        match tokio::fs::remove_file(&version_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let binary_path = self.binary_path();
        path.persist(&binary_path).map_err(|e| e.error)?;
        tokio::fs::write(&version_path, version).await?;

        info!("Installed codeowners-lsp {} at {:?}", version, binary_path);
        Ok(binary_path)
    }
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}
