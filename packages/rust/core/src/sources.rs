//! Source-list loading for batch runs.
//!
//! Two formats are accepted: a JSON array whose entries are URL strings or
//! objects with a `github_url` field, and newline-delimited URLs where blank
//! lines and `#` comments are ignored. Entries that do not parse as a
//! repository URL are logged and skipped.

use std::path::Path;

use serde_json::Value;
use tracing::warn;

use mcpextract_shared::{ExtractorError, Result, SourceId};

/// Read and parse the source list at `path`.
pub fn load_sources(path: &Path) -> Result<Vec<SourceId>> {
    let text = std::fs::read_to_string(path).map_err(|e| ExtractorError::io(path, e))?;
    parse_source_list(&text)
}

/// Parse a source list, preserving input order (duplicates included).
pub fn parse_source_list(text: &str) -> Result<Vec<SourceId>> {
    let trimmed = text.trim_start();
    let raw: Vec<String> = if trimmed.starts_with('[') {
        let entries: Vec<Value> = serde_json::from_str(trimmed)
            .map_err(|e| ExtractorError::parse(format!("invalid source list JSON: {e}")))?;
        entries
            .iter()
            .filter_map(|entry| match entry {
                Value::String(url) => Some(url.clone()),
                Value::Object(obj) => obj
                    .get("github_url")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
                _ => None,
            })
            .collect()
    } else {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_owned)
            .collect()
    };

    Ok(raw
        .iter()
        .filter_map(|url| match SourceId::parse(url) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(url, error = %e, "skipping invalid source");
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_strings_and_objects() {
        let text = r#"[
            "https://github.com/acme/weather",
            {"github_url": "https://github.com/acme/files.git", "stars": 10},
            {"name": "no url"},
            42
        ]"#;
        let sources = parse_source_list(text).unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[1].as_str(), "https://github.com/acme/files");
    }

    #[test]
    fn parses_newline_list_with_comments() {
        let text = "# curated\nhttps://github.com/a/one\n\n  https://github.com/a/two/  \nnot a url\n";
        let sources = parse_source_list(text).unwrap();
        let urls: Vec<_> = sources.iter().map(SourceId::as_str).collect();
        assert_eq!(urls, vec!["https://github.com/a/one", "https://github.com/a/two"]);
    }

    #[test]
    fn broken_json_is_a_parse_error() {
        assert!(parse_source_list("[\"https://github.com/a/b\",").is_err());
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_sources(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(matches!(err, ExtractorError::Io { .. }));
    }
}
