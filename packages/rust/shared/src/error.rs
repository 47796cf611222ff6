//! Error taxonomy shared by the library crates.
//!
//! The CLI converts [`ExtractorError`] into `color-eyre` reports.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ExtractorError {
    /// Bad or missing configuration (file, env var, flag).
    #[error("invalid configuration: {message}")]
    Config { message: String },

    /// Transport-level failure talking to GitHub or a model endpoint.
    #[error("request failed: {0}")]
    Network(String),

    /// The repository can never be read: private, archived, missing or
    /// rate-limited. Terminal for that source.
    #[error("source inaccessible: {0}")]
    Inaccessible(String),

    /// The model call itself failed.
    #[error("model error: {0}")]
    Generation(String),

    /// Malformed input: source URLs, source lists, candidate JSON.
    #[error("malformed input: {message}")]
    Parse { message: String },

    /// Database failure. Run-fatal inside the orchestrator.
    #[error("database: {0}")]
    Storage(String),

    #[error("cannot access {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Broken invariant: illegal state transition, oversized bundle, and so on.
    #[error("invalid state: {message}")]
    Validation { message: String },
}

pub type Result<T> = std::result::Result<T, ExtractorError>;

impl ExtractorError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error means the source itself can never be processed.
    pub fn is_inaccessible(&self) -> bool {
        matches!(self, Self::Inaccessible(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_their_context() {
        let err = ExtractorError::config("OPENROUTER_API_KEY is not set");
        assert_eq!(
            err.to_string(),
            "invalid configuration: OPENROUTER_API_KEY is not set"
        );

        let err = ExtractorError::io(
            "/tmp/sources.json",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("sources.json"));
    }

    #[test]
    fn only_inaccessible_sources_are_terminal_fetch_errors() {
        assert!(ExtractorError::Inaccessible("acme/w is archived".into()).is_inaccessible());
        assert!(!ExtractorError::Network("connection reset".into()).is_inaccessible());
        assert!(!ExtractorError::Storage("locked".into()).is_inaccessible());
    }
}
