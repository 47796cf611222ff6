//! GitHub REST crawler.
//!
//! Reads repository metadata, then walks the file roles in fetch order and
//! binds the first existing candidate path of each role. Primary roles
//! (readme, build manifest, env template) are always attempted before the
//! optional container and build files.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use mcpextract_shared::{
    AppConfig, ExtractorError, FileRole, RepoMetadata, Result, SourceBundle, SourceId,
};

use crate::SourceFetcher;

/// User-Agent string for GitHub requests.
const USER_AGENT: &str = concat!("mcpextract/", env!("CARGO_PKG_VERSION"));

/// Media type returning file contents as raw bytes.
const RAW_MEDIA_TYPE: &str = "application/vnd.github.raw";

/// Media type for JSON API responses.
const JSON_MEDIA_TYPE: &str = "application/vnd.github+json";

// ---------------------------------------------------------------------------
// CrawlerConfig
// ---------------------------------------------------------------------------

/// Runtime crawler configuration.
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// REST API root, e.g. `https://api.github.com`.
    pub api_base: String,
    /// Optional bearer token.
    pub token: Option<String>,
    pub timeout: Duration,
}

impl From<&AppConfig> for CrawlerConfig {
    fn from(config: &AppConfig) -> Self {
        let token = std::env::var(&config.github.token_env)
            .ok()
            .filter(|t| !t.is_empty());
        Self {
            api_base: config.github.api_base.trim_end_matches('/').to_string(),
            token,
            timeout: Duration::from_secs(config.github.timeout_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Role → path strategy
// ---------------------------------------------------------------------------

/// Candidate repository paths for `role`, tried in order.
///
/// The build manifest depends on the primary language; an unknown language
/// yields no candidates for that role.
pub fn candidate_paths(role: FileRole, language: Option<&str>) -> &'static [&'static str] {
    match role {
        FileRole::Readme => &["README.md", "README.rst", "README.txt"],
        FileRole::BuildManifest => match language {
            Some("JavaScript" | "TypeScript") => &["package.json"],
            Some("Python") => &["pyproject.toml"],
            Some("Rust") => &["Cargo.toml"],
            Some("Go") => &["go.mod"],
            _ => &[],
        },
        FileRole::EnvTemplate => &[".env.example", ".env.template", ".env.sample"],
        FileRole::Dockerfile => &["Dockerfile"],
        FileRole::Compose => &["docker-compose.yml"],
        FileRole::Makefile => &["Makefile"],
    }
}

// ---------------------------------------------------------------------------
// GitHubCrawler
// ---------------------------------------------------------------------------

/// Repository resource fields we read.
#[derive(Debug, Deserialize)]
struct RepoResponse {
    name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    topics: Vec<String>,
    language: Option<String>,
    homepage: Option<String>,
    #[serde(default)]
    archived: bool,
}

/// Fetches source bundles from the GitHub REST API.
pub struct GitHubCrawler {
    config: CrawlerConfig,
    client: Client,
}

impl GitHubCrawler {
    /// Create a new crawler with the given configuration.
    pub fn new(config: CrawlerConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(config.timeout)
            .build()
            .map_err(|e| ExtractorError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    fn get(&self, url: &str, accept: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url).header(header::ACCEPT, accept);
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Read repository metadata. Every non-success answer is terminal.
    async fn fetch_metadata(&self, source: &SourceId) -> Result<RepoMetadata> {
        let url = format!(
            "{}/repos/{}/{}",
            self.config.api_base,
            source.owner(),
            source.repo()
        );
        let response = self
            .get(&url, JSON_MEDIA_TYPE)
            .send()
            .await
            .map_err(|e| ExtractorError::Network(format!("{source}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_repo_error(source, status, response.headers()));
        }

        let repo: RepoResponse = response
            .json()
            .await
            .map_err(|e| ExtractorError::Network(format!("{source}: bad metadata body: {e}")))?;

        if repo.archived {
            return Err(ExtractorError::Inaccessible(format!(
                "{source}: repository is archived"
            )));
        }

        Ok(RepoMetadata {
            name: repo.name,
            description: repo.description.filter(|d| !d.trim().is_empty()),
            topics: repo.topics,
            language: repo.language,
            homepage: repo.homepage.filter(|h| !h.trim().is_empty()),
        })
    }

    /// Read one file's raw text. Absent, empty, or unreadable files yield `None`.
    async fn fetch_file(&self, source: &SourceId, path: &str) -> Option<String> {
        let url = format!(
            "{}/repos/{}/{}/contents/{path}",
            self.config.api_base,
            source.owner(),
            source.repo()
        );

        let response = match self.get(&url, RAW_MEDIA_TYPE).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(%source, path, error = %e, "file fetch failed");
                return None;
            }
        };

        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!(%source, path, "file not present");
                None
            }
            status if status.is_success() => match response.text().await {
                Ok(text) if !text.trim().is_empty() => Some(text),
                Ok(_) => None,
                Err(e) => {
                    warn!(%source, path, error = %e, "file body read failed");
                    None
                }
            },
            status => {
                warn!(%source, path, status = status.as_u16(), "file fetch returned error status");
                None
            }
        }
    }
}

#[async_trait]
impl SourceFetcher for GitHubCrawler {
    #[instrument(skip_all, fields(source = %source))]
    async fn fetch(&self, source: &SourceId) -> Result<SourceBundle> {
        let metadata = self.fetch_metadata(source).await?;
        let language = metadata.language.clone();
        let mut builder = SourceBundle::builder(source.clone(), metadata);

        // Role order puts primary roles first.
        for role in FileRole::ALL {
            for path in candidate_paths(role, language.as_deref()) {
                if let Some(content) = self.fetch_file(source, path).await {
                    builder.bind(role, *path, content)?;
                    break;
                }
            }
        }

        let bundle = builder.build();
        info!(
            files = bundle.file_count(),
            language = language.as_deref().unwrap_or("unknown"),
            "source bundle fetched"
        );
        Ok(bundle)
    }
}

/// Map a repository-level error status onto the error taxonomy.
fn classify_repo_error(
    source: &SourceId,
    status: StatusCode,
    headers: &header::HeaderMap,
) -> ExtractorError {
    let rate_limited = status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN
            && headers
                .get("x-ratelimit-remaining")
                .and_then(|v| v.to_str().ok())
                == Some("0"));

    if rate_limited {
        return ExtractorError::Inaccessible(format!("{source}: GitHub rate limit exceeded"));
    }

    match status {
        StatusCode::NOT_FOUND => {
            ExtractorError::Inaccessible(format!("{source}: repository not found or private"))
        }
        StatusCode::FORBIDDEN => ExtractorError::Inaccessible(format!("{source}: access forbidden")),
        StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS => {
            ExtractorError::Inaccessible(format!("{source}: unavailable for legal reasons"))
        }
        other => ExtractorError::Network(format!("{source}: HTTP {other}")),
    }
}

#[cfg(test)]
mod crawler_tests {
    use super::*;
    use wiremock::matchers::{header as header_is, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn crawler_for(server: &MockServer, token: Option<&str>) -> GitHubCrawler {
        GitHubCrawler::new(CrawlerConfig {
            api_base: server.uri(),
            token: token.map(str::to_owned),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    async fn mount_repo(server: &MockServer, body: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/repos/acme/weather"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    async fn mount_file(server: &MockServer, file: &str, body: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/repos/acme/weather/contents/{file}")))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    fn source() -> SourceId {
        SourceId::parse("https://github.com/acme/weather").unwrap()
    }

    fn bound_path(bundle: &SourceBundle, role: FileRole) -> Option<&str> {
        bundle
            .files()
            .find(|(bound, _)| *bound == role)
            .map(|(_, file)| file.path.as_str())
    }

    #[test]
    fn manifest_follows_language() {
        assert_eq!(
            candidate_paths(FileRole::BuildManifest, Some("TypeScript")),
            &["package.json"]
        );
        assert_eq!(
            candidate_paths(FileRole::BuildManifest, Some("Python")),
            &["pyproject.toml"]
        );
        assert!(candidate_paths(FileRole::BuildManifest, Some("Haskell")).is_empty());
        assert!(candidate_paths(FileRole::BuildManifest, None).is_empty());
    }

    #[tokio::test]
    async fn fetch_binds_first_found_path_per_role() {
        let server = MockServer::start().await;
        mount_repo(
            &server,
            serde_json::json!({
                "name": "weather",
                "description": "Weather MCP server",
                "topics": ["mcp", "weather"],
                "language": "TypeScript",
                "homepage": "",
                "archived": false
            }),
        )
        .await;
        // README.md is absent (404 by default), README.rst wins.
        mount_file(&server, "README.rst", "Weather\n=======\n").await;
        mount_file(&server, "README.txt", "should not be fetched").await;
        mount_file(&server, "package.json", r#"{"name":"@acme/weather"}"#).await;
        mount_file(&server, ".env.sample", "WEATHER_API_KEY=\n").await;
        mount_file(&server, "Dockerfile", "FROM node:20\n").await;

        let crawler = crawler_for(&server, None);
        let bundle = crawler.fetch(&source()).await.unwrap();

        assert_eq!(bundle.file_count(), 4);
        assert_eq!(bound_path(&bundle, FileRole::Readme), Some("README.rst"));
        assert_eq!(bound_path(&bundle, FileRole::EnvTemplate), Some(".env.sample"));
        assert_eq!(bound_path(&bundle, FileRole::Makefile), None);
        assert_eq!(bundle.metadata().topics, vec!["mcp", "weather"]);
        assert_eq!(bundle.metadata().homepage, None);
        assert_eq!(bundle.display_name(), "weather");
    }

    #[tokio::test]
    async fn file_server_errors_are_treated_as_absent() {
        let server = MockServer::start().await;
        mount_repo(&server, serde_json::json!({"name": "weather", "language": "Go"})).await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/weather/contents/README.md"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        mount_file(&server, "go.mod", "module example.com/weather\n").await;

        let bundle = crawler_for(&server, None).fetch(&source()).await.unwrap();
        assert_eq!(bundle.file_count(), 1);
        assert_eq!(bound_path(&bundle, FileRole::BuildManifest), Some("go.mod"));
    }

    #[tokio::test]
    async fn missing_repo_is_inaccessible() {
        let server = MockServer::start().await;
        let err = crawler_for(&server, None).fetch(&source()).await.unwrap_err();
        assert!(err.is_inaccessible(), "got {err}");
    }

    #[tokio::test]
    async fn archived_repo_is_inaccessible() {
        let server = MockServer::start().await;
        mount_repo(&server, serde_json::json!({"name": "weather", "archived": true})).await;
        let err = crawler_for(&server, None).fetch(&source()).await.unwrap_err();
        assert!(err.is_inaccessible());
        assert!(err.to_string().contains("archived"));
    }

    #[tokio::test]
    async fn rate_limit_is_inaccessible() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/weather"))
            .respond_with(
                ResponseTemplate::new(403).insert_header("x-ratelimit-remaining", "0"),
            )
            .mount(&server)
            .await;
        let err = crawler_for(&server, None).fetch(&source()).await.unwrap_err();
        assert!(err.to_string().contains("rate limit"));
    }

    #[tokio::test]
    async fn server_error_is_not_inaccessible() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/weather"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        let err = crawler_for(&server, None).fetch(&source()).await.unwrap_err();
        assert!(!err.is_inaccessible());
    }

    #[tokio::test]
    async fn token_is_sent_as_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/weather"))
            .and(header_is("authorization", "Bearer s3cret"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"name": "weather"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let bundle = crawler_for(&server, Some("s3cret"))
            .fetch(&source())
            .await
            .unwrap();
        assert_eq!(bundle.file_count(), 0);
    }
}
