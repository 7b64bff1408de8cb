//! GitHub Releases API implementation

use std::time::Duration;

use reqwest::Url;
use reqwest::header::{ACCEPT, LOCATION};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::release::error::NetworkError;
use crate::release::feed::ReleaseFeed;
use crate::release::types::ReleaseDescriptor;

/// Default base URL for the GitHub REST API
const DEFAULT_API_URL: &str = "https://api.github.com";

/// Repository publishing codeowners-lsp releases
pub const DEFAULT_REPOSITORY: &str = "radiosilence/codeowners-lsp";

/// Redirects followed before a request is abandoned
pub const MAX_REDIRECTS: usize = 5;

const GITHUB_JSON: &str = "application/vnd.github.v3+json";

/// Whole-request limit for release metadata
const API_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest silence tolerated while a response body is streaming
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Release feed backed by the GitHub Releases API
pub struct GitHubReleaseFeed {
    client: reqwest::Client,
    api_url: String,
    repository: String,
    api_timeout: Duration,
}

impl GitHubReleaseFeed {
    /// Creates a feed for `repository` ("owner/name") on a custom API base URL
    pub fn new(api_url: &str, repository: &str) -> Result<Self, NetworkError> {
        // Redirects are followed by hand so the hop count stays bounded.
        let client = reqwest::Client::builder()
            .user_agent(concat!("codeowners-client/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(READ_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            repository: repository.to_string(),
            api_timeout: API_TIMEOUT,
        })
    }

    /// Overrides the whole-request limit for release metadata. Asset
    /// downloads are only bounded by the read timeout.
    pub fn with_api_timeout(mut self, timeout: Duration) -> Self {
        self.api_timeout = timeout;
        self
    }

    /// Feed for the official repository on api.github.com
    pub fn official() -> Result<Self, NetworkError> {
        Self::new(DEFAULT_API_URL, DEFAULT_REPOSITORY)
    }

    pub fn latest_release_url(&self) -> String {
        format!("{}/repos/{}/releases/latest", self.api_url, self.repository)
    }

    /// Issues a GET and follows 3xx responses until a terminal status.
    /// Returns the final response only when it is a 2xx.
    async fn get(
        &self,
        url: &str,
        accept: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, NetworkError> {
        let mut current = Url::parse(url).map_err(|e| NetworkError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        for _ in 0..=MAX_REDIRECTS {
            let mut request = self.client.get(current.clone());
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }

            let response = request.send().await?;
            let status = response.status();

            if !status.is_redirection() {
                if !status.is_success() {
                    warn!("Release feed returned status {}: {}", status, current);
                    return Err(NetworkError::Status {
                        status,
                        url: current.to_string(),
                    });
                }
                return Ok(response);
            }

            let next = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|location| current.join(location).ok())
                .ok_or_else(|| NetworkError::MissingLocation {
                    url: current.to_string(),
                })?;

            debug!("Following {} redirect {} -> {}", status, current, next);
            current = next;
        }

        Err(NetworkError::TooManyRedirects {
            url: url.to_string(),
            limit: MAX_REDIRECTS,
        })
    }
}

#[async_trait::async_trait]
impl ReleaseFeed for GitHubReleaseFeed {
    async fn fetch_latest_release(&self) -> Result<ReleaseDescriptor, NetworkError> {
        let url = self.latest_release_url();
        debug!("Fetching latest release from {}", url);

        let response = self
            .get(&url, Some(GITHUB_JSON), Some(self.api_timeout))
            .await?;

        let release: ReleaseDescriptor = response.json().await.map_err(|e| {
            if e.is_timeout() {
                return NetworkError::Request(e);
            }
            warn!("Failed to parse release response: {}", e);
            NetworkError::InvalidBody(e.to_string())
        })?;

        info!(
            "Latest release is {} with {} assets",
            release.tag_name,
            release.assets.len()
        );
        Ok(release)
    }

    async fn download(&self, url: &str, dest: &mut File) -> Result<u64, NetworkError> {
        info!("Downloading {}", url);

        let mut response = self.get(url, None, None).await?;
        let mut written = 0u64;

        while let Some(chunk) = response.chunk().await? {
            dest.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        dest.flush().await?;

        debug!("Downloaded {} bytes from {}", written, url);
        Ok(written)
    }
}
