//! Shared types, error model, and configuration for mcpextract.
//!
//! This crate is the foundation depended on by all other mcpextract crates.
//! It provides:
//! - [`ExtractorError`]: the unified error type
//! - Source types ([`SourceId`], [`SourceBundle`], [`FileRole`], [`RunId`])
//! - Candidate and result types ([`CandidateConfig`], [`ValidationReport`],
//!   [`Disposition`], [`OutputRecord`])
//! - Configuration ([`AppConfig`], [`GeneratorConfig`], [`BatchConfig`], config loading)

pub mod config;
pub mod error;
pub mod record;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BatchConfig, BatchSection, GeneratorConfig, GithubSection, InstallSection,
    LlmProvider, LlmSection, StorageSection, Thresholds, config_dir, config_file_path,
    expand_home, init_config, load_config, load_config_from, validate_api_key,
};
pub use error::{ExtractorError, Result};
pub use record::{
    CandidateConfig, Disposition, GenerationFailure, GenerationOutcome, InstallMethod,
    OutputRecord, RAW_RESPONSE_LIMIT, Transport, ValidationReport, VariableDescriptor,
};
pub use types::{
    FileRole, MAX_BUNDLE_FILES, RepoMetadata, RunId, SourceBundle, SourceBundleBuilder, SourceFile,
    SourceId,
};
