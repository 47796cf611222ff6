//! ConfigGenerator: one model call per bundle, folded into a
//! [`GenerationOutcome`].
//!
//! Every way the call can go wrong (transport error, timeout, unparseable
//! output) becomes a [`GenerationFailure`]; nothing here returns `Err` or
//! retries.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use mcpextract_shared::{
    CandidateConfig, GenerationFailure, GenerationOutcome, GeneratorConfig, SourceBundle,
};

use crate::llm::{ModelClient, ModelRequest};
use crate::prompt::{SYSTEM_PROMPT, build_prompt};

/// Converts a [`SourceBundle`] into a candidate configuration.
pub struct ConfigGenerator {
    client: Arc<dyn ModelClient>,
    config: GeneratorConfig,
}

impl ConfigGenerator {
    pub fn new(client: Arc<dyn ModelClient>, config: GeneratorConfig) -> Self {
        Self { client, config }
    }

    /// Issue exactly one model call for `bundle`.
    #[instrument(skip_all, fields(source = %bundle.id(), client = self.client.name()))]
    pub async fn generate(&self, bundle: &SourceBundle) -> GenerationOutcome {
        let request = ModelRequest {
            system: SYSTEM_PROMPT.to_string(),
            prompt: build_prompt(bundle, &self.config.install_preference),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };
        debug!(prompt_chars = request.prompt.len(), "calling model");

        let response =
            match tokio::time::timeout(self.config.timeout, self.client.complete(&request)).await {
                Err(_) => {
                    warn!(timeout_secs = self.config.timeout.as_secs_f64(), "model call timed out");
                    return GenerationOutcome::Failure(GenerationFailure::new(format!(
                        "model call timed out after {:.1}s",
                        self.config.timeout.as_secs_f64()
                    )));
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "model call failed");
                    return GenerationOutcome::Failure(GenerationFailure::new(format!(
                        "model call failed: {e}"
                    )));
                }
                Ok(Ok(response)) => response,
            };

        debug!(
            model = %response.model,
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "model answered"
        );
        parse_model_output(&response.text)
    }
}

/// Remove a surrounding markdown code fence (```` ``` ```` or ```` ```json ````).
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. `json`) on the opening fence line.
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest.trim_start_matches("json"),
    };
    body.trim_end().trim_end_matches("```").trim()
}

/// Parse raw model text into an outcome.
///
/// Fences are stripped first; if the remainder is not JSON, the span from the
/// first `{` to the last `}` is tried before giving up.
pub fn parse_model_output(raw: &str) -> GenerationOutcome {
    let cleaned = strip_code_fences(raw);

    let parsed = serde_json::from_str::<Value>(cleaned).ok().or_else(|| {
        let start = cleaned.find('{')?;
        let end = cleaned.rfind('}')?;
        (start < end)
            .then(|| serde_json::from_str::<Value>(&cleaned[start..=end]).ok())
            .flatten()
    });

    match parsed {
        Some(Value::Object(map)) => GenerationOutcome::Success(CandidateConfig::from_map(map)),
        Some(_) => GenerationOutcome::Failure(
            GenerationFailure::new("model output is not a JSON object").with_raw_response(raw),
        ),
        None => GenerationOutcome::Failure(
            GenerationFailure::new("invalid JSON from model").with_raw_response(raw),
        ),
    }
}
