//! Resolves the codeowners-lsp executable an editor session should run

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ExtensionConfig;
use crate::platform::PlatformTarget;
use crate::provision::error::ProvisionError;
use crate::release::cache::CacheStore;
use crate::release::error::NetworkError;
use crate::release::feed::ReleaseFeed;
use crate::release::types::{BINARY_NAME, compute_asset_name};

/// Where a resolved binary came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinarySource {
    CustomPath,
    SearchPath,
    Cache,
    Download,
}

/// The single executable path a provisioning attempt settled on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBinary {
    pub path: PathBuf,
    pub source: BinarySource,
    /// Known only for binaries managed by the cache
    pub version: Option<String>,
}

impl ResolvedBinary {
    fn unversioned(path: PathBuf, source: BinarySource) -> Self {
        Self {
            path,
            source,
            version: None,
        }
    }
}

pub struct Provisioner {
    feed: Arc<dyn ReleaseFeed>,
    storage_root: PathBuf,
    platform: Option<PlatformTarget>,
    search_path: Option<OsString>,
    home_dir: Option<PathBuf>,
    /// Held for a whole `ensure_binary` call so overlapping requests queue
    in_flight: Mutex<()>,
}

impl Provisioner {
    /// Creates a provisioner for the current machine: detected platform,
    /// the process PATH and the user's home directory.
    pub fn new(feed: Arc<dyn ReleaseFeed>, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            feed,
            storage_root: storage_root.into(),
            platform: PlatformTarget::identify(),
            search_path: std::env::var_os("PATH"),
            home_dir: dirs::home_dir(),
            in_flight: Mutex::new(()),
        }
    }

    pub fn with_platform(mut self, platform: Option<PlatformTarget>) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_search_path(mut self, search_path: Option<OsString>) -> Self {
        self.search_path = search_path;
        self
    }

    pub fn with_home_dir(mut self, home_dir: Option<PathBuf>) -> Self {
        self.home_dir = home_dir;
        self
    }

    /// Cache store for this machine, or None on an unsupported platform
    pub fn cache(&self) -> Option<CacheStore> {
        self.platform
            .as_ref()
            .map(|platform| CacheStore::new(&self.storage_root, platform))
    }

    /// Resolves the executable to launch. First match wins:
    ///
    /// 1. configured server path (must exist, never falls through)
    /// 2. `codeowners-lsp` on the search path
    /// 3. cached binary when it matches the latest release, or when the feed
    ///    is unreachable
    /// 4. fresh download of the latest release into the cache
    pub async fn ensure_binary(
        &self,
        config: &ExtensionConfig,
    ) -> Result<ResolvedBinary, ProvisionError> {
        let _guard = self.in_flight.lock().await;

        if let Some(custom) = config.custom_server_path() {
            return self.resolve_custom_path(custom);
        }

        if let Some(path) = self.find_on_search_path() {
            info!("Using codeowners-lsp from PATH at {:?}", path);
            return Ok(ResolvedBinary::unversioned(path, BinarySource::SearchPath));
        }

        let Some(platform) = self.platform else {
            return Err(unsupported_platform());
        };

        let cache = CacheStore::new(&self.storage_root, &platform);
        let cached_version = cache.read_cached_version();
        debug!("Cached codeowners-lsp version: {:?}", cached_version);

        let release = match self.feed.fetch_latest_release().await {
            Ok(release) => release,
            Err(e) => {
                let Some(version) = cached_version else {
                    return Err(e.into());
                };
                warn!(
                    "Release check failed ({}), falling back to cached {}",
                    e, version
                );
                return Ok(cached(&cache, version));
            }
        };

        let latest = release.version();
        if cached_version.as_deref() == Some(latest) && cache.binary_path().is_file() {
            info!("Cached codeowners-lsp {} is up to date", latest);
            return Ok(cached(&cache, latest.to_string()));
        }

        let expected =
            compute_asset_name(latest, Some(&platform)).ok_or_else(unsupported_platform)?;
        let Some(asset) = release.find_asset(&expected) else {
            warn!("Release {} has no asset named {}", release.tag_name, expected);
            return Err(ProvisionError::AssetNotFound {
                asset: expected,
                target: platform.triple(),
            });
        };

        info!(
            "Downloading codeowners-lsp {} (cached: {:?})",
            latest, cached_version
        );
        let mut staged = cache.stage()?;
        self.feed
            .download(&asset.browser_download_url, staged.file_mut())
            .await
            .map_err(|e| {
                if let Some(version) = &cached_version {
                    warn!(
                        "Download of {} failed, cached {} left in place but not used",
                        latest, version
                    );
                }
                match e {
                    NetworkError::Write(io) => ProvisionError::Cache(io),
                    other => ProvisionError::Network(other),
                }
            })?;

        let path = cache.commit(staged, latest).await?;
        Ok(ResolvedBinary {
            path,
            source: BinarySource::Download,
            version: Some(latest.to_string()),
        })
    }

    fn resolve_custom_path(&self, custom: &str) -> Result<ResolvedBinary, ProvisionError> {
        let path = expand_home(custom, self.home_dir.as_deref());

        if !path.exists() {
            warn!("Configured server path {:?} does not exist", path);
            return Err(ProvisionError::Configuration { path });
        }

        info!("Using configured codeowners-lsp at {:?}", path);
        Ok(ResolvedBinary::unversioned(path, BinarySource::CustomPath))
    }

    fn find_on_search_path(&self) -> Option<PathBuf> {
        let search_path = self.search_path.as_ref()?;
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

        which::which_in(BINARY_NAME, Some(search_path), cwd)
            .ok()
            .filter(|path| path.is_file())
    }
}

fn unsupported_platform() -> ProvisionError {
    ProvisionError::UnsupportedPlatform {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
    }
}

fn cached(cache: &CacheStore, version: String) -> ResolvedBinary {
    ResolvedBinary {
        path: cache.binary_path(),
        source: BinarySource::Cache,
        version: Some(version),
    }
}

/// Expands a leading `~` to the home directory
fn expand_home(path: &str, home: Option<&Path>) -> PathBuf {
    let Some(home) = home else {
        return PathBuf::from(path);
    };

    if path == "~" {
        return home.to_path_buf();
    }

    match path
        .strip_prefix("~/")
        .or_else(|| path.strip_prefix("~\\"))
    {
        Some(rest) => home.join(rest),
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;
    use tokio::fs::File;
    use tokio::io::AsyncWriteExt;

    use crate::release::types::{ReleaseAsset, ReleaseDescriptor};

    const LINUX_ASSET: &str = "codeowners-lsp-1.2.3-x86_64-unknown-linux-gnu";

    /// In-memory feed counting every network call
    struct FakeFeed {
        release: Option<ReleaseDescriptor>,
        payload: Vec<u8>,
        download_fails: bool,
        fetches: AtomicUsize,
        downloads: AtomicUsize,
    }

    impl FakeFeed {
        fn online(tag: &str, asset_names: &[&str]) -> Arc<Self> {
            let assets = asset_names
                .iter()
                .map(|name| ReleaseAsset {
                    name: name.to_string(),
                    browser_download_url: format!("https://example.com/{}", name),
                })
                .collect();

            Arc::new(Self {
                release: Some(ReleaseDescriptor {
                    tag_name: tag.to_string(),
                    assets,
                }),
                payload: b"downloaded binary".to_vec(),
                download_fails: false,
                fetches: AtomicUsize::new(0),
                downloads: AtomicUsize::new(0),
            })
        }

        fn offline() -> Arc<Self> {
            Arc::new(Self {
                release: None,
                payload: Vec::new(),
                download_fails: false,
                fetches: AtomicUsize::new(0),
                downloads: AtomicUsize::new(0),
            })
        }

        /// Publishes a release whose asset download always fails
        fn broken_download(tag: &str, asset_names: &[&str]) -> Arc<Self> {
            let mut feed = Arc::into_inner(Self::online(tag, asset_names)).unwrap();
            feed.download_fails = true;
            Arc::new(feed)
        }

        fn network_calls(&self) -> usize {
            self.fetches.load(Ordering::SeqCst) + self.downloads.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl ReleaseFeed for FakeFeed {
        async fn fetch_latest_release(&self) -> Result<ReleaseDescriptor, NetworkError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.release
                .clone()
                .ok_or_else(|| NetworkError::InvalidBody("feed offline".to_string()))
        }

        async fn download(&self, _url: &str, dest: &mut File) -> Result<u64, NetworkError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            if self.download_fails {
                dest.write_all(b"partial").await?;
                return Err(NetworkError::InvalidBody("connection reset".to_string()));
            }
            dest.write_all(&self.payload).await?;
            Ok(self.payload.len() as u64)
        }
    }

    fn provisioner(feed: &Arc<FakeFeed>, temp_dir: &TempDir) -> Provisioner {
        let empty_path = temp_dir.path().join("empty-bin");
        std::fs::create_dir_all(&empty_path).unwrap();

        Provisioner::new(
            Arc::clone(feed) as Arc<dyn ReleaseFeed>,
            temp_dir.path().join("storage"),
        )
        .with_platform(PlatformTarget::from_parts("linux", "x86_64"))
        .with_search_path(Some(empty_path.into_os_string()))
        .with_home_dir(Some(temp_dir.path().to_path_buf()))
    }

    fn seed_cache(provisioner: &Provisioner, version: &str, content: &str) -> CacheStore {
        let cache = provisioner.cache().unwrap();
        std::fs::create_dir_all(cache.storage_dir()).unwrap();
        std::fs::write(cache.binary_path(), content).unwrap();
        std::fs::write(cache.version_path(), version).unwrap();
        cache
    }

    #[tokio::test]
    async fn custom_path_is_returned_without_network() {
        let temp_dir = TempDir::new().unwrap();
        let feed = FakeFeed::online("v1.2.3", &[LINUX_ASSET]);
        let provisioner = provisioner(&feed, &temp_dir);
        let custom = temp_dir.path().join("my-lsp");
        std::fs::write(&custom, "custom").unwrap();

        let config = ExtensionConfig {
            server_path: Some(custom.to_string_lossy().into_owned()),
            ..Default::default()
        };
        let resolved = provisioner.ensure_binary(&config).await.unwrap();

        assert_eq!(resolved.path, custom);
        assert_eq!(resolved.source, BinarySource::CustomPath);
        assert_eq!(feed.network_calls(), 0);
    }

    #[tokio::test]
    async fn custom_path_expands_home_directory() {
        let temp_dir = TempDir::new().unwrap();
        let feed = FakeFeed::offline();
        let provisioner = provisioner(&feed, &temp_dir);
        std::fs::create_dir_all(temp_dir.path().join("bin")).unwrap();
        std::fs::write(temp_dir.path().join("bin/codeowners-lsp"), "custom").unwrap();

        let config = ExtensionConfig {
            server_path: Some("~/bin/codeowners-lsp".to_string()),
            ..Default::default()
        };
        let resolved = provisioner.ensure_binary(&config).await.unwrap();

        assert_eq!(resolved.path, temp_dir.path().join("bin/codeowners-lsp"));
        assert_eq!(feed.network_calls(), 0);
    }

    #[tokio::test]
    async fn missing_custom_path_fails_without_fallback() {
        let temp_dir = TempDir::new().unwrap();
        let feed = FakeFeed::online("v1.2.3", &[LINUX_ASSET]);
        let provisioner = provisioner(&feed, &temp_dir);
        seed_cache(&provisioner, "1.2.3", "cached");

        let config = ExtensionConfig {
            server_path: Some("/definitely/not/here/codeowners-lsp".to_string()),
            ..Default::default()
        };
        let result = provisioner.ensure_binary(&config).await;

        assert!(matches!(result, Err(ProvisionError::Configuration { .. })));
        assert_eq!(feed.network_calls(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn search_path_binary_is_trusted() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let feed = FakeFeed::online("v1.2.3", &[LINUX_ASSET]);
        let bin_dir = temp_dir.path().join("path-bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        let on_path = bin_dir.join("codeowners-lsp");
        std::fs::write(&on_path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&on_path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let provisioner =
            provisioner(&feed, &temp_dir).with_search_path(Some(bin_dir.into_os_string()));
        let resolved = provisioner
            .ensure_binary(&ExtensionConfig::default())
            .await
            .unwrap();

        assert_eq!(resolved.path, on_path);
        assert_eq!(resolved.source, BinarySource::SearchPath);
        assert_eq!(feed.network_calls(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_custom_path_ignores_binary_on_search_path() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let feed = FakeFeed::online("v1.2.3", &[LINUX_ASSET]);
        let bin_dir = temp_dir.path().join("path-bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        let on_path = bin_dir.join("codeowners-lsp");
        std::fs::write(&on_path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&on_path, std::fs::Permissions::from_mode(0o755)).unwrap();
        let provisioner =
            provisioner(&feed, &temp_dir).with_search_path(Some(bin_dir.into_os_string()));

        let config = ExtensionConfig {
            server_path: Some(temp_dir.path().join("missing-lsp").to_string_lossy().into_owned()),
            ..Default::default()
        };
        let result = provisioner.ensure_binary(&config).await;

        match result {
            Err(ProvisionError::Configuration { path }) => {
                assert_eq!(path, temp_dir.path().join("missing-lsp"))
            }
            other => panic!("expected Configuration error, got {:?}", other),
        }
        assert_eq!(feed.network_calls(), 0);
    }

    #[tokio::test]
    async fn unsupported_platform_fails() {
        let temp_dir = TempDir::new().unwrap();
        let feed = FakeFeed::online("v1.2.3", &[LINUX_ASSET]);
        let provisioner = provisioner(&feed, &temp_dir).with_platform(None);

        let result = provisioner.ensure_binary(&ExtensionConfig::default()).await;

        assert!(matches!(
            result,
            Err(ProvisionError::UnsupportedPlatform { .. })
        ));
        assert_eq!(feed.network_calls(), 0);
    }

    #[tokio::test]
    async fn up_to_date_cache_skips_download() {
        let temp_dir = TempDir::new().unwrap();
        let feed = FakeFeed::online("v1.2.3", &[LINUX_ASSET]);
        let provisioner = provisioner(&feed, &temp_dir);
        let cache = seed_cache(&provisioner, "1.2.3", "cached");

        let resolved = provisioner
            .ensure_binary(&ExtensionConfig::default())
            .await
            .unwrap();

        assert_eq!(resolved.path, cache.binary_path());
        assert_eq!(resolved.source, BinarySource::Cache);
        assert_eq!(resolved.version.as_deref(), Some("1.2.3"));
        assert_eq!(feed.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(feed.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn offline_feed_falls_back_to_cache() {
        let temp_dir = TempDir::new().unwrap();
        let feed = FakeFeed::offline();
        let provisioner = provisioner(&feed, &temp_dir);
        let cache = seed_cache(&provisioner, "0.9.0", "cached");

        let resolved = provisioner
            .ensure_binary(&ExtensionConfig::default())
            .await
            .unwrap();

        assert_eq!(resolved.path, cache.binary_path());
        assert_eq!(resolved.source, BinarySource::Cache);
        assert_eq!(resolved.version.as_deref(), Some("0.9.0"));
    }

    #[tokio::test]
    async fn offline_feed_without_cache_is_network_error() {
        let temp_dir = TempDir::new().unwrap();
        let feed = FakeFeed::offline();
        let provisioner = provisioner(&feed, &temp_dir);

        let result = provisioner.ensure_binary(&ExtensionConfig::default()).await;

        assert!(matches!(result, Err(ProvisionError::Network(_))));
    }

    #[tokio::test]
    async fn missing_asset_leaves_cache_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let feed = FakeFeed::online(
            "v2.0.0",
            &["codeowners-lsp-2.0.0-aarch64-apple-darwin"],
        );
        let provisioner = provisioner(&feed, &temp_dir);
        let cache = seed_cache(&provisioner, "1.0.0", "old binary");

        let result = provisioner.ensure_binary(&ExtensionConfig::default()).await;

        match result {
            Err(ProvisionError::AssetNotFound { asset, target }) => {
                assert_eq!(asset, "codeowners-lsp-2.0.0-x86_64-unknown-linux-gnu");
                assert_eq!(target, "x86_64-unknown-linux-gnu");
            }
            other => panic!("expected AssetNotFound, got {:?}", other),
        }
        assert_eq!(feed.downloads.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read(cache.binary_path()).unwrap(), b"old binary");
        assert_eq!(cache.read_cached_version(), Some("1.0.0".to_string()));
    }

    #[tokio::test]
    async fn stale_cache_is_replaced_by_download() {
        let temp_dir = TempDir::new().unwrap();
        let feed = FakeFeed::online("v1.2.3", &[LINUX_ASSET]);
        let provisioner = provisioner(&feed, &temp_dir);
        let cache = seed_cache(&provisioner, "1.0.0", "old binary");

        let resolved = provisioner
            .ensure_binary(&ExtensionConfig::default())
            .await
            .unwrap();

        assert_eq!(resolved.source, BinarySource::Download);
        assert_eq!(resolved.path, cache.binary_path());
        assert_eq!(
            std::fs::read(cache.binary_path()).unwrap(),
            b"downloaded binary"
        );
        assert_eq!(cache.read_cached_version(), Some("1.2.3".to_string()));
    }

    #[tokio::test]
    async fn failed_download_keeps_stale_cache_and_reports_network_error() {
        let temp_dir = TempDir::new().unwrap();
        let feed = FakeFeed::broken_download("v1.2.3", &[LINUX_ASSET]);
        let provisioner = provisioner(&feed, &temp_dir);
        let cache = seed_cache(&provisioner, "1.0.0", "old binary");

        let result = provisioner.ensure_binary(&ExtensionConfig::default()).await;

        assert!(matches!(result, Err(ProvisionError::Network(_))));
        assert_eq!(std::fs::read(cache.binary_path()).unwrap(), b"old binary");
        assert_eq!(cache.read_cached_version(), Some("1.0.0".to_string()));
        let staged: Vec<_> = std::fs::read_dir(cache.storage_dir())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(staged.is_empty());
    }

    #[tokio::test]
    async fn overlapping_requests_download_once() {
        let temp_dir = TempDir::new().unwrap();
        let feed = FakeFeed::online("v1.2.3", &[LINUX_ASSET]);
        let provisioner = provisioner(&feed, &temp_dir);
        let config = ExtensionConfig::default();

        let (first, second) = tokio::join!(
            provisioner.ensure_binary(&config),
            provisioner.ensure_binary(&config)
        );

        let mut sources = vec![first.unwrap().source, second.unwrap().source];
        sources.sort_by_key(|source| *source == BinarySource::Cache);
        assert_eq!(sources, vec![BinarySource::Download, BinarySource::Cache]);
        assert_eq!(feed.downloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn expand_home_only_touches_leading_tilde() {
        let home = Path::new("/home/user");

        assert_eq!(expand_home("~", Some(home)), PathBuf::from("/home/user"));
        assert_eq!(
            expand_home("~/bin/lsp", Some(home)),
            PathBuf::from("/home/user/bin/lsp")
        );
        assert_eq!(expand_home("/opt/~/lsp", Some(home)), PathBuf::from("/opt/~/lsp"));
        assert_eq!(expand_home("~other/lsp", Some(home)), PathBuf::from("~other/lsp"));
        assert_eq!(expand_home("~/bin/lsp", None), PathBuf::from("~/bin/lsp"));
    }
}
