//! Prompt construction for configuration extraction.

use mcpextract_shared::{InstallMethod, SourceBundle};

/// Per-file character budget inside the prompt.
pub const FILE_CHAR_LIMIT: usize = 15_000;

/// Appended to any file cut at [`FILE_CHAR_LIMIT`].
const TRUNCATION_MARKER: &str = "\n\n[... truncated ...]";

/// System instructions sent with every extraction request.
pub const SYSTEM_PROMPT: &str = "You extract startup configurations for Model Context Protocol \
servers from repository files. Answer with a single JSON object and nothing else. If the \
files do not describe how to start the server, answer {\"error\": \"<reason>\", \
\"partial_info\": {...}}.";

/// Expected answer shape.
const SCHEMA: &str = r#"{
  "name": "server name",
  "install": "one-time install command, or null",
  "command": "launcher executable, e.g. npx, docker, uvx, python",
  "args": ["argument", "..."],
  "env": {
    "VAR_NAME": {
      "required": true,
      "description": "what the variable configures",
      "default": null,
      "example": "example value",
      "where_to_get": "URL where the value can be obtained, or null",
      "validation_pattern": "regex the value must match, or null"
    }
  },
  "transport": "stdio | sse | websocket",
  "confidence": 0.0,
  "warnings": ["anything uncertain about this configuration"]
}"#;

/// Truncate `content` to at most `limit` characters on a char boundary,
/// appending a marker when anything was cut.
pub fn truncate_content(content: &str, limit: usize) -> String {
    match content.char_indices().nth(limit) {
        Some((cut, _)) => {
            let mut truncated = String::with_capacity(cut + TRUNCATION_MARKER.len());
            truncated.push_str(&content[..cut]);
            truncated.push_str(TRUNCATION_MARKER);
            truncated
        }
        None => content.to_string(),
    }
}

/// Build the user prompt for `bundle`.
pub fn build_prompt(bundle: &SourceBundle, preference: &[InstallMethod]) -> String {
    let meta = bundle.metadata();
    let topics = if meta.topics.is_empty() {
        "None".to_string()
    } else {
        meta.topics.join(", ")
    };
    let order = preference
        .iter()
        .map(InstallMethod::as_str)
        .collect::<Vec<_>>()
        .join(" > ");

    let mut prompt = format!(
        "# Repository\n\
         URL: {url}\n\
         Name: {name}\n\
         Description: {description}\n\
         Topics: {topics}\n\
         Language: {language}\n\
         Homepage: {homepage}\n",
        url = bundle.id(),
        name = bundle.display_name(),
        description = meta.description.as_deref().unwrap_or("No description"),
        language = meta.language.as_deref().unwrap_or("Unknown"),
        homepage = meta.homepage.as_deref().unwrap_or("None"),
    );

    prompt.push_str(&format!(
        "\n# Instructions\n\
         When several installation methods are documented, pick exactly one using this \
         preference order: {order}.\n\
         List every environment variable the server reads. Mark a variable required only \
         when it has no default.\n"
    ));
    prompt.push_str(&format!("\n# Answer schema\n```json\n{SCHEMA}\n```\n"));

    prompt.push_str("\n# Files\n");
    for (_, file) in bundle.files() {
        let content = truncate_content(&file.content, FILE_CHAR_LIMIT);
        prompt.push_str(&format!("\n## {}\n```\n{content}\n```\n", file.path));
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpextract_shared::{FileRole, RepoMetadata, SourceId};

    fn bundle(readme: &str) -> SourceBundle {
        let meta = RepoMetadata {
            name: Some("weather".into()),
            description: None,
            topics: vec!["mcp".into(), "weather".into()],
            language: Some("TypeScript".into()),
            homepage: None,
        };
        let mut builder =
            SourceBundle::builder(SourceId::parse("https://github.com/acme/weather").unwrap(), meta);
        builder.bind(FileRole::Readme, "README.md", readme).unwrap();
        builder
            .bind(FileRole::EnvTemplate, ".env.example", "WEATHER_KEY=")
            .unwrap();
        builder.build()
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "ü".repeat(20);
        let cut = truncate_content(&text, 5);
        assert!(cut.starts_with("üüüüü"));
        assert!(cut.ends_with("[... truncated ...]"));
        assert_eq!(truncate_content("short", 5), "short");
    }

    #[test]
    fn prompt_lists_metadata_files_and_preference() {
        let prompt = build_prompt(&bundle("# Weather"), &InstallMethod::PREFERENCE);
        assert!(prompt.contains("Name: weather"));
        assert!(prompt.contains("Topics: mcp, weather"));
        assert!(prompt.contains("Description: No description"));
        assert!(prompt.contains("npx > docker > pip > build"));
        assert!(prompt.contains("## README.md"));
        assert!(prompt.contains("## .env.example"));
        assert!(prompt.find("README.md") < prompt.find(".env.example"));
    }

    #[test]
    fn prompt_sections_appear_in_order() {
        let prompt = build_prompt(&bundle("# Weather"), &[InstallMethod::Docker]);
        let sections: Vec<_> = ["# Repository", "# Instructions", "# Answer schema", "# Files"]
            .iter()
            .map(|heading| prompt.find(heading).expect(heading))
            .collect();
        assert!(sections.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(prompt.starts_with("# Repository\nURL: https://github.com/acme/weather\n"));
        assert!(prompt.contains("Language: TypeScript\nHomepage: None\n"));
        assert!(prompt.contains("preference order: docker."));
        assert!(prompt.contains("\"validation_pattern\""));
    }

    #[test]
    fn oversized_files_are_truncated_in_prompt() {
        let big = "x".repeat(FILE_CHAR_LIMIT + 100);
        let prompt = build_prompt(&bundle(&big), &InstallMethod::PREFERENCE);
        assert!(prompt.contains("[... truncated ...]"));
        assert!(!prompt.contains(&"x".repeat(FILE_CHAR_LIMIT + 1)));
    }
}
