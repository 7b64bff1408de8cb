use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unexpected status {status} from {url}")]
    Status {
        status: reqwest::StatusCode,
        url: String,
    },

    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Redirect from {url} has no usable Location header")]
    MissingLocation { url: String },

    #[error("Gave up after {limit} redirects starting at {url}")]
    TooManyRedirects { url: String, limit: usize },

    #[error("Invalid release response: {0}")]
    InvalidBody(String),

    #[error("Failed to write download: {0}")]
    Write(#[from] std::io::Error),
}
