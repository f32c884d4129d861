//! Code generation providers.
//!
//! The generator is a single request/response operation: given a request,
//! return a candidate file set. Provider-specific retry and backoff stay
//! beneath [`CodeGenerator::generate`].

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::prompt::{render_prompt, SYSTEM_PROMPT};
use super::retry::{with_retry, CircuitBreaker, RetryConfig};
use crate::domain::{FileSet, GenerationRequest};

/// Errors from a code generation provider.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    #[error("provider transport error: {0}")]
    Transport(String),

    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("circuit breaker open after {consecutive_failures} consecutive failures")]
    CircuitOpen { consecutive_failures: u32 },

    #[error("provider response contained no files")]
    EmptyResponse,

    #[error("malformed provider response: {0}")]
    Malformed(String),

    #[error("generator not configured: {0}")]
    NotConfigured(String),
}

impl GenerationError {
    /// Network failures, rate limits and server errors are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerationError::Transport(_) => true,
            GenerationError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        GenerationError::Transport(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub files: FileSet,
    pub usage: TokenUsage,
    pub model: String,
}

#[async_trait]
pub trait CodeGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, GenerationError>;
}

/// Extract `<file path="...">...</file>` blocks from model output.
///
/// A Markdown code fence wrapping a block's contents is stripped.
pub fn parse_file_blocks(text: &str) -> FileSet {
    static FILE_BLOCK: OnceLock<Regex> = OnceLock::new();
    let re = FILE_BLOCK.get_or_init(|| {
        Regex::new(r#"(?s)<file\s+path="([^"]+)"\s*>(.*?)</file>"#)
            .unwrap_or_else(|e| panic!("invalid file block pattern: {e}"))
    });

    let mut files = FileSet::new();
    for caps in re.captures_iter(text) {
        let path = caps[1].trim().trim_start_matches("./").to_string();
        if path.is_empty() || path.contains("..") {
            continue;
        }
        files.insert(path, strip_fence(&caps[2]));
    }
    files
}

fn strip_fence(body: &str) -> String {
    let trimmed = body.trim_matches('\n');
    let inner = trimmed.trim();
    if inner.starts_with("```") && inner.ends_with("```") && inner.len() >= 6 {
        let without_open = match inner.find('\n') {
            Some(idx) => &inner[idx + 1..],
            None => "",
        };
        let without_close = without_open.trim_end().trim_end_matches("```");
        return without_close.trim_end_matches('\n').to_string() + "\n";
    }
    let mut s = trimmed.to_string();
    if !s.ends_with('\n') {
        s.push('\n');
    }
    s
}

/// HTTP provider configuration (Messages-style API).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpGeneratorConfig {
    pub endpoint: String,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub api_version: String,
    pub max_tokens: u32,
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for HttpGeneratorConfig {
    fn default() -> Self {
        HttpGeneratorConfig {
            endpoint: "https://api.anthropic.com/v1/messages".to_string(),
            model: "claude-3-5-sonnet-latest".to_string(),
            api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            api_version: "2023-06-01".to_string(),
            max_tokens: 8_192,
            request_timeout: Duration::from_secs(120),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    model: Option<String>,
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Generator backed by an HTTP model API.
pub struct HttpCodeGenerator {
    config: HttpGeneratorConfig,
    http_client: reqwest::Client,
    breaker: CircuitBreaker,
}

impl HttpCodeGenerator {
    pub fn new(config: HttpGeneratorConfig) -> Result<Self, GenerationError> {
        if config.api_key.as_deref().map(str::is_empty).unwrap_or(true) {
            return Err(GenerationError::NotConfigured("missing API key".to_string()));
        }
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("autocoder/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .build()?;
        let breaker = CircuitBreaker::from_config(&config.retry);
        Ok(Self {
            config,
            http_client,
            breaker,
        })
    }

    async fn send(&self, prompt: &str) -> Result<MessagesResponse, GenerationError> {
        let body = MessagesRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            system: SYSTEM_PROMPT,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };
        let mut request = self
            .http_client
            .post(&self.config.endpoint)
            .header("anthropic-version", &self.config.api_version)
            .json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.header("x-api-key", key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<MessagesResponse>()
            .await
            .map_err(|e| GenerationError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl CodeGenerator for HttpCodeGenerator {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip(self, request), fields(attempt = request.attempt_number, model = %self.config.model))]
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, GenerationError> {
        let prompt = render_prompt(request);
        let response = with_retry(&self.config.retry, &self.breaker, || self.send(&prompt)).await?;

        let text: String = response
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");
        let files = parse_file_blocks(&text);
        if files.is_empty() {
            return Err(GenerationError::EmptyResponse);
        }

        let usage = response
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.input_tokens,
                completion_tokens: u.output_tokens,
            })
            .unwrap_or_default();
        debug!(files = files.len(), prompt_tokens = usage.prompt_tokens, "generation complete");

        Ok(GenerationOutput {
            files,
            usage,
            model: response.model.unwrap_or_else(|| self.config.model.clone()),
        })
    }
}
