//! Core source types: identities, repository metadata, and file bundles.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;
use uuid::Uuid;

use crate::error::{ExtractorError, Result};

/// Maximum number of files a bundle may carry.
pub const MAX_BUNDLE_FILES: usize = 6;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for batch run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// SourceId
// ---------------------------------------------------------------------------

/// Normalized repository URL, the unique key of a source.
///
/// Normal form is `https://<host>/<owner>/<repo>`: host lower-cased, no
/// trailing slash, no `.git` suffix, no query or fragment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    /// Parse and normalize a repository URL.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ExtractorError::parse("empty source URL"));
        }

        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("https://{trimmed}")
        };

        let url = Url::parse(&with_scheme)
            .map_err(|e| ExtractorError::parse(format!("invalid source URL '{trimmed}': {e}")))?;

        let host = url
            .host_str()
            .ok_or_else(|| ExtractorError::parse(format!("source URL '{trimmed}' has no host")))?
            .to_ascii_lowercase();

        let mut segments = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter();

        let (Some(owner), Some(repo)) = (segments.next(), segments.next()) else {
            return Err(ExtractorError::parse(format!(
                "source URL '{trimmed}' must point at <owner>/<repo>"
            )));
        };
        let repo = repo.strip_suffix(".git").unwrap_or(repo);
        if repo.is_empty() {
            return Err(ExtractorError::parse(format!(
                "source URL '{trimmed}' has an empty repository name"
            )));
        }

        // GitHub resolves owner and repository names case-insensitively.
        if is_github_host(&host) {
            return Ok(Self(format!(
                "https://{host}/{}/{}",
                owner.to_ascii_lowercase(),
                repo.to_ascii_lowercase()
            )));
        }
        Ok(Self(format!("https://{host}/{owner}/{repo}")))
    }

    /// The normalized URL.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Repository owner (first path segment).
    pub fn owner(&self) -> &str {
        self.path_parts().0
    }

    /// Repository name (second path segment).
    pub fn repo(&self) -> &str {
        self.path_parts().1
    }

    fn path_parts(&self) -> (&str, &str) {
        // Normal form guarantees `https://host/owner/repo`.
        let mut parts = self.0.rsplitn(3, '/');
        let repo = parts.next().unwrap_or_default();
        let owner = parts.next().unwrap_or_default();
        (owner, repo)
    }
}

fn is_github_host(host: &str) -> bool {
    matches!(host, "github.com" | "www.github.com")
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for SourceId {
    type Err = ExtractorError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// FileRole
// ---------------------------------------------------------------------------

/// Logical role a retrieved file plays in a bundle.
///
/// Declaration order is the fetch order: primary roles first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRole {
    Readme,
    BuildManifest,
    EnvTemplate,
    Dockerfile,
    Compose,
    Makefile,
}

impl FileRole {
    /// All roles in fetch order.
    pub const ALL: [FileRole; 6] = [
        Self::Readme,
        Self::BuildManifest,
        Self::EnvTemplate,
        Self::Dockerfile,
        Self::Compose,
        Self::Makefile,
    ];

    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Readme => "readme",
            Self::BuildManifest => "build_manifest",
            Self::EnvTemplate => "env_template",
            Self::Dockerfile => "dockerfile",
            Self::Compose => "compose",
            Self::Makefile => "makefile",
        }
    }

    /// Primary roles are attempted before any optional role.
    pub fn is_primary(&self) -> bool {
        matches!(self, Self::Readme | Self::BuildManifest | Self::EnvTemplate)
    }
}

// ---------------------------------------------------------------------------
// RepoMetadata / SourceBundle
// ---------------------------------------------------------------------------

/// Repository metadata as reported by the hosting service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
}

/// One retrieved file bound to a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Repository path that satisfied the role (e.g. `README.rst`).
    pub path: String,
    /// Raw text content.
    pub content: String,
}

/// The retrieved files and metadata for one repository.
///
/// Built once by the crawler and never mutated afterwards; fields are only
/// reachable through accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceBundle {
    id: SourceId,
    metadata: RepoMetadata,
    files: BTreeMap<FileRole, SourceFile>,
}

impl SourceBundle {
    /// Start building a bundle for `id`.
    pub fn builder(id: SourceId, metadata: RepoMetadata) -> SourceBundleBuilder {
        SourceBundleBuilder {
            bundle: SourceBundle {
                id,
                metadata,
                files: BTreeMap::new(),
            },
        }
    }

    pub fn id(&self) -> &SourceId {
        &self.id
    }

    pub fn metadata(&self) -> &RepoMetadata {
        &self.metadata
    }

    /// Bound files in role order.
    pub fn files(&self) -> impl Iterator<Item = (FileRole, &SourceFile)> {
        self.files.iter().map(|(role, file)| (*role, file))
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Display name: metadata name, falling back to the repository name.
    pub fn display_name(&self) -> &str {
        self.metadata
            .name
            .as_deref()
            .unwrap_or_else(|| self.id.repo())
    }

    /// SHA-256 over identity, metadata, and file contents.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_str().as_bytes());
        if let Ok(meta) = serde_json::to_vec(&self.metadata) {
            hasher.update(&meta);
        }
        for (role, file) in &self.files {
            hasher.update(role.as_str().as_bytes());
            hasher.update(file.path.as_bytes());
            hasher.update([0u8]);
            hasher.update(file.content.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Incremental constructor enforcing the one-file-per-role invariant.
#[derive(Debug)]
pub struct SourceBundleBuilder {
    bundle: SourceBundle,
}

impl SourceBundleBuilder {
    /// Bind `content` to `role`. Fails if the role is already bound or the
    /// bundle is full.
    pub fn bind(
        &mut self,
        role: FileRole,
        path: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<()> {
        if self.bundle.files.contains_key(&role) {
            return Err(ExtractorError::validation(format!(
                "role {} already bound for {}",
                role.as_str(),
                self.bundle.id
            )));
        }
        if self.bundle.files.len() >= MAX_BUNDLE_FILES {
            return Err(ExtractorError::validation(format!(
                "bundle for {} already holds {MAX_BUNDLE_FILES} files",
                self.bundle.id
            )));
        }
        self.bundle.files.insert(
            role,
            SourceFile {
                path: path.into(),
                content: content.into(),
            },
        );
        Ok(())
    }

    /// Whether `role` already has a file.
    pub fn is_bound(&self, role: FileRole) -> bool {
        self.bundle.files.contains_key(&role)
    }

    pub fn build(self) -> SourceBundle {
        self.bundle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_id_normalizes() {
        let id = SourceId::parse("https://GitHub.com/modelcontextprotocol/servers.git/").unwrap();
        assert_eq!(id.as_str(), "https://github.com/modelcontextprotocol/servers");
        assert_eq!(id.owner(), "modelcontextprotocol");
        assert_eq!(id.repo(), "servers");

        let deep = SourceId::parse("github.com/owner/repo/tree/main/src?tab=readme#top").unwrap();
        assert_eq!(deep.as_str(), "https://github.com/owner/repo");
    }

    #[test]
    fn github_identity_ignores_case() {
        let upper = SourceId::parse("https://GitHub.com/Acme/Weather").unwrap();
        let lower = SourceId::parse("https://github.com/acme/weather").unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.owner(), "acme");

        let other = SourceId::parse("https://gitlab.com/Acme/Weather").unwrap();
        assert_eq!(other.as_str(), "https://gitlab.com/Acme/Weather");
    }

    #[test]
    fn source_id_rejects_incomplete_urls() {
        assert!(SourceId::parse("").is_err());
        assert!(SourceId::parse("https://github.com/only-owner").is_err());
        assert!(SourceId::parse("https://github.com/").is_err());
    }

    #[test]
    fn run_id_is_unique() {
        assert_ne!(RunId::new(), RunId::new());
    }

    #[test]
    fn bundle_rejects_double_binding() {
        let id = SourceId::parse("https://github.com/a/b").unwrap();
        let mut builder = SourceBundle::builder(id, RepoMetadata::default());
        builder.bind(FileRole::Readme, "README.md", "# b").unwrap();
        let err = builder.bind(FileRole::Readme, "README.rst", "b").unwrap_err();
        assert!(err.to_string().contains("already bound"));

        let bundle = builder.build();
        assert_eq!(bundle.file_count(), 1);
        let bound: Vec<_> = bundle.files().map(|(role, file)| (role, file.path.as_str())).collect();
        assert_eq!(bound, vec![(FileRole::Readme, "README.md")]);
        assert_eq!(bundle.display_name(), "b");
    }

    #[test]
    fn digest_tracks_content() {
        let id = SourceId::parse("https://github.com/a/b").unwrap();
        let mut first = SourceBundle::builder(id.clone(), RepoMetadata::default());
        first.bind(FileRole::Readme, "README.md", "one").unwrap();
        let mut second = SourceBundle::builder(id, RepoMetadata::default());
        second.bind(FileRole::Readme, "README.md", "two").unwrap();

        let first = first.build();
        assert_eq!(first.digest(), first.clone().digest());
        assert_ne!(first.digest(), second.build().digest());
    }

    #[test]
    fn roles_are_ordered_primary_first() {
        let primary: Vec<_> = FileRole::ALL.iter().filter(|r| r.is_primary()).collect();
        assert_eq!(primary.len(), 3);
        assert!(FileRole::EnvTemplate < FileRole::Dockerfile);
    }
}
