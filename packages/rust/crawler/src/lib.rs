//! Source retrieval for mcpextract.
//!
//! This crate provides:
//! - [`SourceFetcher`]: the interface the batch orchestrator fetches bundles through
//! - [`GitHubCrawler`]: a GitHub REST implementation that binds README,
//!   build manifest, env template and container/build files to roles

pub mod engine;

use async_trait::async_trait;

use mcpextract_shared::{Result, SourceBundle, SourceId};

pub use engine::{CrawlerConfig, GitHubCrawler, candidate_paths};

/// Retrieves the file bundle for one source.
///
/// Missing files are omitted from the bundle. A source that can never be read
/// (private, archived, missing, rate-limited) fails with
/// [`mcpextract_shared::ExtractorError::Inaccessible`].
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, source: &SourceId) -> Result<SourceBundle>;
}
