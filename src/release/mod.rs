// Release layer
// - types.rs: ReleaseDescriptor, asset naming
// - feed.rs: ReleaseFeed trait definition
// - github.rs: GitHub Releases API implementation
// - cache.rs: local binary + version sidecar store
// - error.rs: NetworkError

pub mod cache;
pub mod error;
pub mod feed;
pub mod github;
pub mod types;

pub use cache::{CacheStore, StagedBinary};
pub use error::NetworkError;
pub use feed::ReleaseFeed;
pub use github::GitHubReleaseFeed;
pub use types::{ReleaseAsset, ReleaseDescriptor};
