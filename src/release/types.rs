//! Release descriptor types and asset naming

use serde::Deserialize;

use crate::platform::PlatformTarget;

/// Name of the server executable, both on PATH and in release assets
pub const BINARY_NAME: &str = "codeowners-lsp";

/// A downloadable file attached to a release
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
}

/// Latest published release, as returned by the feed
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReleaseDescriptor {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

impl ReleaseDescriptor {
    /// Tag with a leading "v" removed ("v1.2.3" -> "1.2.3")
    pub fn version(&self) -> &str {
        normalize_tag(&self.tag_name)
    }

    /// Finds the asset with exactly the given name
    pub fn find_asset(&self, name: &str) -> Option<&ReleaseAsset> {
        self.assets.iter().find(|asset| asset.name == name)
    }
}

/// Strips a single leading "v" from a release tag
pub fn normalize_tag(tag: &str) -> &str {
    tag.strip_prefix('v').unwrap_or(tag)
}

/// Asset file name for a version on a platform:
/// `{binary}-{version}-{arch}-{os}{suffix}`
pub fn asset_name(version: &str, platform: &PlatformTarget) -> String {
    format!(
        "{}-{}-{}-{}{}",
        BINARY_NAME,
        version,
        platform.arch_tag(),
        platform.os_tag(),
        platform.exe_suffix()
    )
}

/// Same as [`asset_name`], but yields None when the platform is unsupported
pub fn compute_asset_name(version: &str, platform: Option<&PlatformTarget>) -> Option<String> {
    platform.map(|platform| asset_name(version, platform))
}
