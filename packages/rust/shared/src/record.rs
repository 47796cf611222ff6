//! Pipeline records: generator output, validation reports, and the persisted
//! output record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ExtractorError, Result};
use crate::types::SourceId;

/// Maximum characters of raw model output kept on a failure.
pub const RAW_RESPONSE_LIMIT: usize = 500;

// ---------------------------------------------------------------------------
// Generator output
// ---------------------------------------------------------------------------

/// Unvalidated structured output produced by the model.
///
/// Held as a raw JSON object: nothing about its shape is trusted until the
/// validator has looked at it. Accessors return `None` for absent or
/// wrongly-typed fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateConfig(Map<String, Value>);

impl CandidateConfig {
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Wrap a JSON value; only objects qualify.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Parse a candidate from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ExtractorError::parse(format!("invalid candidate JSON: {e}")))?;
        Self::from_value(value)
            .ok_or_else(|| ExtractorError::parse("candidate JSON is not an object"))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Terminal extraction error, if the candidate carries one.
    ///
    /// Any non-null `error` counts; non-string values are rendered as JSON.
    pub fn error(&self) -> Option<String> {
        match self.0.get("error")? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.str_field("name")
    }

    pub fn command(&self) -> Option<&str> {
        self.str_field("command")
    }

    pub fn install(&self) -> Option<&str> {
        self.str_field("install")
    }

    /// The `args` list, if every element is a string.
    pub fn args(&self) -> Option<Vec<&str>> {
        self.0
            .get("args")?
            .as_array()?
            .iter()
            .map(Value::as_str)
            .collect()
    }

    pub fn env(&self) -> Option<&Map<String, Value>> {
        self.0.get("env")?.as_object()
    }

    pub fn transport(&self) -> Option<&str> {
        self.str_field("transport")
    }

    /// Self-reported confidence, when numeric.
    pub fn confidence(&self) -> Option<f64> {
        self.0.get("confidence")?.as_f64()
    }

    /// String entries of the candidate's own `warnings` list.
    pub fn warnings(&self) -> Vec<String> {
        self.0
            .get("warnings")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key)?.as_str()
    }
}

/// Why a generation attempt produced no candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationFailure {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl GenerationFailure {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            raw_response: None,
        }
    }

    /// Attach the raw model text, truncated to [`RAW_RESPONSE_LIMIT`] chars.
    pub fn with_raw_response(mut self, raw: &str) -> Self {
        self.raw_response = Some(raw.chars().take(RAW_RESPONSE_LIMIT).collect());
        self
    }

    /// The failure in candidate shape: `{"error": .., "raw_response": ..}`.
    pub fn to_candidate(&self) -> CandidateConfig {
        let mut map = Map::new();
        map.insert("error".into(), Value::String(self.error.clone()));
        if let Some(raw) = &self.raw_response {
            map.insert("raw_response".into(), Value::String(raw.clone()));
        }
        CandidateConfig(map)
    }
}

/// Result of one generation attempt. Never an exception.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Success(CandidateConfig),
    Failure(GenerationFailure),
}

impl GenerationOutcome {
    /// Collapse into candidate shape; failures carry `error`.
    pub fn into_candidate(self) -> CandidateConfig {
        match self {
            Self::Success(candidate) => candidate,
            Self::Failure(failure) => failure.to_candidate(),
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration fields
// ---------------------------------------------------------------------------

/// How one environment variable is documented.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableDescriptor {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub example: Option<String>,
    #[serde(default)]
    pub where_to_get: Option<String>,
    #[serde(default)]
    pub validation_pattern: Option<String>,
}

impl VariableDescriptor {
    /// Best-effort read of a descriptor object; scalars are stringified.
    pub fn from_value(value: &Value) -> Self {
        let field = |key: &str| -> Option<String> {
            match value.get(key)? {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                _ => None,
            }
        };
        Self {
            required: value
                .get("required")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            description: field("description").unwrap_or_default(),
            default: field("default"),
            example: field("example"),
            where_to_get: field("where_to_get"),
            validation_pattern: field("validation_pattern"),
        }
    }
}

/// Process transport the server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Stdio,
    Sse,
    Websocket,
}

impl Transport {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stdio" => Some(Self::Stdio),
            "sse" => Some(Self::Sse),
            "websocket" => Some(Self::Websocket),
            _ => None,
        }
    }
}

/// Install method inferred from the launch command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallMethod {
    Npx,
    Docker,
    Pip,
    Build,
}

impl InstallMethod {
    /// Fixed reconciliation order when several methods are plausible.
    pub const PREFERENCE: [InstallMethod; 4] = [Self::Npx, Self::Docker, Self::Pip, Self::Build];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Npx => "npx",
            Self::Docker => "docker",
            Self::Pip => "pip",
            Self::Build => "build",
        }
    }

    /// Infer the method from a launch command.
    pub fn classify(command: &str) -> Option<Self> {
        match command {
            "npx" | "npm" | "node" | "bun" | "deno" => Some(Self::Npx),
            "docker" => Some(Self::Docker),
            "uv" | "uvx" | "pip" | "pip3" => Some(Self::Pip),
            "cargo" | "go" => Some(Self::Build),
            c if c.starts_with("python") => Some(Self::Pip),
            c if c.starts_with("./") => Some(Self::Build),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstallMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstallMethod {
    type Err = ExtractorError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "npx" => Ok(Self::Npx),
            "docker" => Ok(Self::Docker),
            "pip" => Ok(Self::Pip),
            "build" => Ok(Self::Build),
            other => Err(ExtractorError::parse(format!("unknown install method: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation and disposition
// ---------------------------------------------------------------------------

/// Outcome of structural validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub confidence_multiplier: f64,
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
            confidence_multiplier: 1.0,
        }
    }
}

impl ValidationReport {
    /// No errors recorded.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn push_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Record a warning and apply its multiplicative penalty.
    pub fn penalize(&mut self, message: impl Into<String>, factor: f64) {
        self.warnings.push(message.into());
        self.confidence_multiplier *= factor;
    }

    /// Record a warning without a penalty.
    pub fn note(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Review class derived from the final confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Approved,
    NeedsReview,
    Rejected,
}

impl Disposition {
    pub const ALL: [Disposition; 3] = [Self::Approved, Self::NeedsReview, Self::Rejected];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::NeedsReview => "needs_review",
            Self::Rejected => "rejected",
        }
    }

    /// Needs a human to look at it.
    pub fn needs_attention(&self) -> bool {
        !matches!(self, Self::Approved)
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Disposition {
    type Err = ExtractorError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Self::Approved),
            "needs_review" => Ok(Self::NeedsReview),
            "rejected" => Ok(Self::Rejected),
            other => Err(ExtractorError::parse(format!("unknown disposition: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Output record
// ---------------------------------------------------------------------------

/// The one persisted record per processed source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub source_id: SourceId,
    pub name: Option<String>,
    pub install: Option<String>,
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, VariableDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<Transport>,
    pub config_type: Option<InstallMethod>,
    pub disposition: Disposition,
    pub confidence: f64,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_hash: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    pub processed_at: DateTime<Utc>,
}

impl OutputRecord {
    /// Build a record from a scored candidate, filling what the candidate
    /// offers even when it is invalid.
    pub fn from_scored(
        source_id: SourceId,
        candidate: &CandidateConfig,
        report: &ValidationReport,
        disposition: Disposition,
        confidence: f64,
    ) -> Self {
        let command = candidate.command().map(str::to_owned);
        let error = candidate.error().or_else(|| {
            (!report.is_valid()).then(|| {
                format!("structural validation failed: {}", report.errors.join("; "))
            })
        });
        let env = candidate
            .env()
            .map(|env| {
                env.iter()
                    .filter(|(_, v)| v.is_object())
                    .map(|(k, v)| (k.clone(), VariableDescriptor::from_value(v)))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            source_id,
            name: candidate.name().map(str::to_owned),
            install: candidate.install().map(str::to_owned),
            config_type: command.as_deref().and_then(InstallMethod::classify),
            command,
            args: candidate
                .args()
                .map(|args| args.into_iter().map(str::to_owned).collect())
                .unwrap_or_default(),
            env,
            transport: candidate.transport().and_then(Transport::parse),
            disposition,
            confidence,
            warnings: report.warnings.clone(),
            error,
            bundle_hash: None,
            attempts: 0,
            processed_at: Utc::now(),
        }
    }

    /// A terminal `rejected` record for a source that produced no candidate.
    pub fn failed(source_id: SourceId, error: impl Into<String>) -> Self {
        Self {
            source_id,
            name: None,
            install: None,
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            transport: None,
            config_type: None,
            disposition: Disposition::Rejected,
            confidence: 0.0,
            warnings: Vec::new(),
            error: Some(error.into()),
            bundle_hash: None,
            attempts: 0,
            processed_at: Utc::now(),
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_bundle_hash(mut self, hash: impl Into<String>) -> Self {
        self.bundle_hash = Some(hash.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn candidate(value: Value) -> CandidateConfig {
        CandidateConfig::from_value(value).expect("object")
    }

    #[test]
    fn candidate_accessors_ignore_wrong_types() {
        let c = candidate(json!({
            "name": "srv",
            "command": 7,
            "args": ["-y", 3],
            "warnings": ["a", 1, "b"],
            "error": null
        }));
        assert_eq!(c.name(), Some("srv"));
        assert_eq!(c.command(), None);
        assert_eq!(c.args(), None);
        assert_eq!(c.warnings(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(c.error(), None);
    }

    #[test]
    fn failure_truncates_raw_response() {
        let raw = "é".repeat(800);
        let failure = GenerationFailure::new("invalid JSON from model").with_raw_response(&raw);
        assert_eq!(failure.raw_response.as_ref().unwrap().chars().count(), 500);

        let as_candidate = GenerationOutcome::Failure(failure).into_candidate();
        assert_eq!(as_candidate.error().as_deref(), Some("invalid JSON from model"));
        assert!(as_candidate.contains("raw_response"));
    }

    #[test]
    fn install_method_classification() {
        assert_eq!(InstallMethod::classify("npx"), Some(InstallMethod::Npx));
        assert_eq!(InstallMethod::classify("node"), Some(InstallMethod::Npx));
        assert_eq!(InstallMethod::classify("docker"), Some(InstallMethod::Docker));
        assert_eq!(InstallMethod::classify("python3.11"), Some(InstallMethod::Pip));
        assert_eq!(InstallMethod::classify("uvx"), Some(InstallMethod::Pip));
        assert_eq!(InstallMethod::classify("./server"), Some(InstallMethod::Build));
        assert_eq!(InstallMethod::classify("java"), None);
        assert_eq!("docker".parse::<InstallMethod>().unwrap(), InstallMethod::Docker);
    }

    #[test]
    fn disposition_round_trips_through_str() {
        for d in Disposition::ALL {
            assert_eq!(d.as_str().parse::<Disposition>().unwrap(), d);
        }
        assert!(Disposition::NeedsReview.needs_attention());
        assert!(!Disposition::Approved.needs_attention());
    }

    #[test]
    fn record_from_invalid_candidate_carries_errors() {
        let id = SourceId::parse("https://github.com/a/b").unwrap();
        let mut report = ValidationReport::default();
        report.push_error("missing required field: name");
        let c = candidate(json!({"command": "docker", "args": ["run"]}));

        let record = OutputRecord::from_scored(id, &c, &report, Disposition::Rejected, 0.0);
        assert_eq!(record.config_type, Some(InstallMethod::Docker));
        assert!(record.error.unwrap().contains("missing required field: name"));
        assert_eq!(record.args, vec!["run".to_string()]);
    }

    #[test]
    fn record_json_shape() {
        let id = SourceId::parse("https://github.com/a/b").unwrap();
        let record = OutputRecord::failed(id, "source inaccessible").with_attempts(1);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["disposition"], "rejected");
        assert_eq!(json["install"], Value::Null);
        assert_eq!(json["source_id"], "https://github.com/a/b");
        assert!(json.get("transport").is_none());
    }
}
