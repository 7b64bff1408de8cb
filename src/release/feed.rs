//! ReleaseFeed trait for fetching server releases

use tokio::fs::File;

use crate::release::error::NetworkError;
use crate::release::types::ReleaseDescriptor;

/// Source of published codeowners-lsp releases
#[async_trait::async_trait]
pub trait ReleaseFeed: Send + Sync {
    /// Fetches the latest published release
    ///
    /// # Returns
    /// * `Ok(ReleaseDescriptor)` - Tag and asset list as published
    /// * `Err(NetworkError)` - Feed unreachable, non-2xx, or malformed body
    async fn fetch_latest_release(&self) -> Result<ReleaseDescriptor, NetworkError>;

    /// Streams the asset at `url` into `dest`, returning the number of bytes written
    async fn download(&self, url: &str, dest: &mut File) -> Result<u64, NetworkError>;
}
