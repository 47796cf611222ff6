//! Model clients.
//!
//! [`ModelClient`] is a single request/response call to a generative text
//! model. Two HTTP implementations are provided: an OpenAI-compatible chat
//! completions client (OpenRouter by default) and an Anthropic messages
//! client. Neither retries; retry policy belongs to the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use mcpextract_shared::{ExtractorError, GeneratorConfig, LlmProvider, Result};

/// User-Agent string for model API requests.
const USER_AGENT: &str = concat!("mcpextract/", env!("CARGO_PKG_VERSION"));

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Maximum characters of an error body echoed into an error message.
const ERROR_BODY_LIMIT: usize = 300;

/// One bounded model call.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Text answer plus token accounting.
#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    pub text: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse>;

    fn name(&self) -> &str;
}

/// Build the client selected by `config`, reading the API key from the
/// configured environment variable.
pub fn build_client(config: &GeneratorConfig) -> Result<Arc<dyn ModelClient>> {
    let api_key = std::env::var(&config.api_key_env)
        .ok()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| {
            ExtractorError::config(format!(
                "model API key not found. Set the {} environment variable.",
                config.api_key_env
            ))
        })?;

    // The generator enforces the per-call timeout; this is a backstop.
    let http_timeout = config.timeout + Duration::from_secs(5);
    let client: Arc<dyn ModelClient> = match config.provider {
        LlmProvider::OpenRouter => Arc::new(OpenAiCompatibleClient::new(
            &config.base_url,
            &config.model,
            Some(api_key),
            http_timeout,
        )?),
        LlmProvider::Anthropic => Arc::new(AnthropicClient::new(
            &config.base_url,
            &config.model,
            api_key,
            http_timeout,
        )?),
    };
    Ok(client)
}

fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|e| ExtractorError::Network(format!("failed to build HTTP client: {e}")))
}

async fn error_for_status(response: reqwest::Response, api: &str) -> ExtractorError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let body: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    ExtractorError::Generation(format!("{api} returned HTTP {status}: {}", body.trim()))
}

// ---------------------------------------------------------------------------
// OpenAI-compatible chat completions
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Client for `POST {base_url}/chat/completions`.
pub struct OpenAiCompatibleClient {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    http: Client,
}

impl OpenAiCompatibleClient {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.to_string(),
            api_key,
            http: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatibleClient {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let mut builder = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| ExtractorError::Network(format!("chat completions: {e}")))?;

        if !response.status().is_success() {
            return Err(error_for_status(response, "chat completions").await);
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            ExtractorError::Generation(format!("unreadable chat completions body: {e}"))
        })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ExtractorError::Generation("model returned no choices".into()))?;
        let usage = parsed.usage.unwrap_or(ChatUsage {
            prompt_tokens: 0,
            completion_tokens: 0,
        });

        debug!(
            model = %self.model,
            input_tokens = usage.prompt_tokens,
            output_tokens = usage.completion_tokens,
            "chat completion received"
        );

        Ok(ModelResponse {
            text,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }
}

// ---------------------------------------------------------------------------
// Anthropic messages
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    model: Option<String>,
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Client for `POST {base_url}/messages`.
pub struct AnthropicClient {
    endpoint: String,
    model: String,
    api_key: String,
    http: Client,
}

impl AnthropicClient {
    pub fn new(base_url: &str, model: &str, api_key: String, timeout: Duration) -> Result<Self> {
        Ok(Self {
            endpoint: format!("{}/messages", base_url.trim_end_matches('/')),
            model: model.to_string(),
            api_key,
            http: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: &request.system,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
        };

        let response = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| ExtractorError::Network(format!("messages: {e}")))?;

        if !response.status().is_success() {
            return Err(error_for_status(response, "messages").await);
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ExtractorError::Generation(format!("unreadable messages body: {e}")))?;

        let text: String = parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");
        if text.is_empty() {
            return Err(ExtractorError::Generation(
                "model returned no text content".into(),
            ));
        }
        let (input_tokens, output_tokens) = parsed
            .usage
            .map(|u| (u.input_tokens, u.output_tokens))
            .unwrap_or_default();

        debug!(model = %self.model, input_tokens, output_tokens, "message received");

        Ok(ModelResponse {
            text,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            input_tokens,
            output_tokens,
        })
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

// ---------------------------------------------------------------------------
// Scripted client for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// One scripted answer.
    pub(crate) enum Scripted {
        Text(String),
        Error(String),
        Delayed(Duration, String),
        Panic,
    }

    /// Replays scripted answers in order; an exhausted script is an error.
    pub(crate) struct ScriptedClient {
        script: Mutex<VecDeque<Scripted>>,
        calls: AtomicUsize,
    }

    impl ScriptedClient {
        pub(crate) fn new(script: impl IntoIterator<Item = Scripted>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn text(texts: &[&str]) -> Self {
            Self::new(texts.iter().map(|t| Scripted::Text((*t).to_string())))
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        async fn complete(&self, _request: &ModelRequest) -> Result<ModelResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            let text = match next {
                Some(Scripted::Text(text)) => text,
                Some(Scripted::Error(message)) => {
                    return Err(ExtractorError::Network(message));
                }
                Some(Scripted::Delayed(delay, text)) => {
                    tokio::time::sleep(delay).await;
                    text
                }
                Some(Scripted::Panic) => panic!("scripted model panic"),
                None => {
                    return Err(ExtractorError::Generation("script exhausted".into()));
                }
            };
            Ok(ModelResponse {
                text,
                model: "scripted".into(),
                ..ModelResponse::default()
            })
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }
}
