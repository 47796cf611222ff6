//! Application configuration for mcpextract.
//!
//! User config lives at `~/.mcpextract/mcpextract.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ExtractorError, Result};
use crate::record::InstallMethod;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "mcpextract.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".mcpextract";

// ---------------------------------------------------------------------------
// Config structs (matching mcpextract.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmSection,

    #[serde(default)]
    pub github: GithubSection,

    #[serde(default)]
    pub batch: BatchSection,

    /// Disposition thresholds.
    #[serde(default)]
    pub thresholds: Thresholds,

    #[serde(default)]
    pub install: InstallSection,

    #[serde(default)]
    pub storage: StorageSection,
}

/// Which model API the generator talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// OpenAI-compatible chat completions (OpenRouter by default).
    #[default]
    OpenRouter,
    /// Anthropic messages API.
    Anthropic,
}

impl LlmProvider {
    /// Endpoint used when `base_url` is not configured.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenRouter => "https://openrouter.ai/api/v1",
            Self::Anthropic => "https://api.anthropic.com/v1",
        }
    }
}

/// `[llm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSection {
    #[serde(default)]
    pub provider: LlmProvider,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Overrides the provider's default endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default)]
    pub temperature: f32,

    /// Per-call timeout for a single model request.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: 0.0,
            timeout_secs: default_llm_timeout(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "deepseek/deepseek-v3.2-exp".into()
}
fn default_max_tokens() -> u32 {
    4000
}
fn default_llm_timeout() -> u64 {
    30
}

/// `[github]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubSection {
    /// Env var holding an optional bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,

    #[serde(default = "default_api_base")]
    pub api_base: String,

    #[serde(default = "default_github_timeout")]
    pub timeout_secs: u64,
}

impl Default for GithubSection {
    fn default() -> Self {
        Self {
            token_env: default_token_env(),
            api_base: default_api_base(),
            timeout_secs: default_github_timeout(),
        }
    }
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".into()
}
fn default_api_base() -> String {
    "https://api.github.com".into()
}
fn default_github_timeout() -> u64 {
    30
}

/// `[batch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSection {
    /// Sources dispatched concurrently per slice.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Generation attempts per source before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
        }
    }
}

fn default_batch_size() -> usize {
    5
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base() -> u64 {
    2000
}
fn default_backoff_max() -> u64 {
    10_000
}

/// `[thresholds]` section; also the runtime view used by the aggregator.
///
/// Both bounds are inclusive: `score >= approve` is approved,
/// `review <= score < approve` needs review.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_approve")]
    pub approve: f64,

    #[serde(default = "default_review")]
    pub review: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            approve: default_approve(),
            review: default_review(),
        }
    }
}

fn default_approve() -> f64 {
    0.9
}
fn default_review() -> f64 {
    0.7
}

/// `[install]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSection {
    /// Install-method preference, most preferred first.
    #[serde(default = "default_preference")]
    pub preference: Vec<InstallMethod>,
}

impl Default for InstallSection {
    fn default() -> Self {
        Self {
            preference: default_preference(),
        }
    }
}

fn default_preference() -> Vec<InstallMethod> {
    InstallMethod::PREFERENCE.to_vec()
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// Database path; a leading `~/` expands to the home directory.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.mcpextract/mcpextract.db".into()
}

impl AppConfig {
    /// Resolved database path.
    pub fn db_path(&self) -> PathBuf {
        expand_home(&self.storage.db_path)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let t = &self.thresholds;
        if !(0.0..=1.0).contains(&t.review) || !(0.0..=1.0).contains(&t.approve) {
            return Err(ExtractorError::config("thresholds must lie within [0, 1]"));
        }
        // An equal pair leaves the needs_review band empty.
        if t.review >= t.approve {
            return Err(ExtractorError::config(format!(
                "review threshold {} must be below approve threshold {}",
                t.review, t.approve
            )));
        }
        if self.batch.batch_size == 0 {
            return Err(ExtractorError::config("batch_size must be at least 1"));
        }
        if self.batch.max_attempts == 0 {
            return Err(ExtractorError::config("max_attempts must be at least 1"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime generator configuration.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub provider: LlmProvider,
    pub model: String,
    pub base_url: String,
    pub api_key_env: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
    /// Install-method preference handed to the prompt builder.
    pub install_preference: Vec<InstallMethod>,
}

impl From<&AppConfig> for GeneratorConfig {
    fn from(config: &AppConfig) -> Self {
        let llm = &config.llm;
        Self {
            provider: llm.provider,
            model: llm.model.clone(),
            base_url: llm
                .base_url
                .clone()
                .unwrap_or_else(|| llm.provider.default_base_url().to_string()),
            api_key_env: llm.api_key_env.clone(),
            max_tokens: llm.max_tokens,
            temperature: llm.temperature,
            timeout: Duration::from_secs(llm.timeout_secs),
            install_preference: config.install.preference.clone(),
        }
    }
}

/// Runtime batch configuration.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Cap on new sources processed in one run.
    pub limit: Option<usize>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for BatchConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            batch_size: config.batch.batch_size.max(1),
            max_attempts: config.batch.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.batch.backoff_base_ms),
            backoff_max: Duration::from_millis(config.batch.backoff_max_ms),
            limit: None,
        }
    }
}

impl BatchConfig {
    /// Delay before retry number `attempt` (1-based):
    /// `min(base * 2^(attempt-1), max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max)
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.mcpextract/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ExtractorError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.mcpextract/mcpextract.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ExtractorError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        ExtractorError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ExtractorError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let content = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| ExtractorError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ExtractorError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the configured model API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    let var_name = &config.llm.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(ExtractorError::config(format!(
            "model API key not found. Set the {var_name} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let toml_str = toml::to_string_pretty(&AppConfig::default()).expect("serialize");
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
        assert!(toml_str.contains("backoff_base_ms"));
        assert!(toml_str.contains("preference"));
    }

    #[test]
    fn config_roundtrip() {
        let toml_str = toml::to_string_pretty(&AppConfig::default()).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.batch.batch_size, 5);
        assert_eq!(parsed.thresholds, Thresholds::default());
        assert_eq!(parsed.install.preference, InstallMethod::PREFERENCE.to_vec());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let toml_str = r#"
[llm]
provider = "anthropic"
model = "claude-sonnet-4-5"

[thresholds]
approve = 0.95
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.llm.provider, LlmProvider::Anthropic);
        assert_eq!(config.thresholds.approve, 0.95);
        assert_eq!(config.thresholds.review, 0.7);
        assert_eq!(config.batch.max_attempts, 3);

        let generator = GeneratorConfig::from(&config);
        assert_eq!(generator.base_url, "https://api.anthropic.com/v1");
        assert_eq!(generator.timeout, Duration::from_secs(30));
    }

    #[test]
    fn inverted_thresholds_rejected() {
        let mut config = AppConfig::default();
        config.thresholds.review = 0.95;
        assert!(config.validate().is_err());

        config.thresholds.review = config.thresholds.approve;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_rejects_unreachable_review_band() {
        let path = std::env::temp_dir().join(format!("mcpx_config_{}.toml", uuid::Uuid::now_v7()));
        std::fs::write(&path, "[thresholds]\napprove = 0.6\nreview = 0.8\n").expect("write");

        let err = load_config_from(&path).unwrap_err();
        assert!(err.to_string().contains("must be below approve threshold"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let batch = BatchConfig::default();
        assert_eq!(batch.backoff(1), Duration::from_millis(2000));
        assert_eq!(batch.backoff(2), Duration::from_millis(4000));
        assert_eq!(batch.backoff(3), Duration::from_millis(8000));
        assert_eq!(batch.backoff(4), Duration::from_millis(10_000));
        assert_eq!(batch.backoff(40), Duration::from_millis(10_000));
    }

    #[test]
    fn expand_home_leaves_plain_paths() {
        assert_eq!(expand_home("/tmp/x.db"), PathBuf::from("/tmp/x.db"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/x.db"), home.join("x.db"));
        }
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        config.llm.api_key_env = "MCPX_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
