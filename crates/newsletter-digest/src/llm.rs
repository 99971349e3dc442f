//! Language-model capability used by the summarizer and the clusterer.
//!
//! The pipeline only ever asks for a completion of a prompt. Prompt wording
//! and reply parsing live with the stage that needs them, so tests can swap
//! the model for a scripted stub (see [`crate::testing`]).

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub max_tokens: u32,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError>;
}

/// Errors returned by the model service.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("request timed out")]
    Timeout,

    #[error("HTTP request failed: {0}")]
    Http(#[source] reqwest::Error),

    #[error("rate limited, retry after {retry_after_secs:?} seconds")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("model returned an empty reply")]
    EmptyResponse,
}

/// How the pipeline reacts to a [`ModelError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying with backoff.
    Transient,
    /// Will recur for every item; abort the run.
    Fatal,
    /// Specific to this request; give up on the item only.
    Local,
}

impl ModelError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ModelError::Timeout | ModelError::RateLimited { .. } => ErrorClass::Transient,
            ModelError::Http(e) => {
                if e.is_decode() {
                    ErrorClass::Local
                } else {
                    ErrorClass::Transient
                }
            }
            ModelError::Api { status, .. } => match status {
                401 | 403 | 404 => ErrorClass::Fatal,
                408 | 409 | 429 | 500..=599 => ErrorClass::Transient,
                _ => ErrorClass::Local,
            },
            ModelError::Authentication(_) | ModelError::Configuration(_) => ErrorClass::Fatal,
            ModelError::EmptyResponse => ErrorClass::Local,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

impl From<reqwest::Error> for ModelError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ModelError::Timeout
        } else {
            ModelError::Http(e)
        }
    }
}

/// The last error seen once a retried call gives up.
#[derive(Debug, Error)]
#[error("{source} (after {attempts} attempt(s))")]
pub struct RetryError {
    pub attempts: u32,
    #[source]
    pub source: ModelError,
}

/// Exponential backoff for transient model errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32, error: &ModelError) -> Duration {
        if let ModelError::RateLimited {
            retry_after_secs: Some(secs),
        } = error
        {
            return Duration::from_secs(*secs).min(self.max_delay);
        }
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or
    /// `max_attempts` is used up.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ModelError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < max_attempts => {
                    let backoff = self.delay_for(attempt, &error);
                    warn!(
                        attempt,
                        max_attempts,
                        ?backoff,
                        %error,
                        "Transient model error, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(error) => {
                    return Err(RetryError {
                        attempts: attempt,
                        source: error,
                    })
                }
            }
        }
    }
}

/// Slices the JSON object out of a model reply, tolerating prose or code
/// fences around it.
pub(crate) fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

#[derive(Serialize)]
struct ClaudeRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ClaudeResponse {
    content: Vec<Content>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Deserialize)]
struct AnthropicError {
    error: AnthropicErrorDetail,
}

#[derive(Deserialize)]
struct AnthropicErrorDetail {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

/// Anthropic Messages API client.
pub struct ClaudeClient {
    client: Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl ClaudeClient {
    pub fn new(api_key: String, model: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_key,
            model,
            endpoint: ANTHROPIC_MESSAGES_URL.to_string(),
        })
    }

    /// Points the client at a different Messages endpoint (proxies, gateways).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn error_from_response(response: reqwest::Response) -> ModelError {
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let text = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("unknown error"));

        classify_error_response(status, retry_after.as_deref(), &text)
    }
}

/// Maps a non-success Messages API response to the error that decides
/// whether the run retries, skips the item or stops.
pub(crate) fn classify_error_response(
    status: u16,
    retry_after: Option<&str>,
    body: &str,
) -> ModelError {
    if status == 429 {
        return ModelError::RateLimited {
            retry_after_secs: retry_after.and_then(|v| v.trim().parse().ok()),
        };
    }

    match serde_json::from_str::<AnthropicError>(body) {
        Ok(error) => match (status, error.error.error_type.as_str()) {
            (401, _) | (403, _) | (_, "authentication_error") | (_, "permission_error") => {
                ModelError::Authentication(error.error.message)
            }
            (404, _) | (_, "not_found_error") => ModelError::Configuration(error.error.message),
            _ => ModelError::Api {
                status,
                message: error.error.message,
            },
        },
        Err(_) => ModelError::Api {
            status,
            message: format!("HTTP {}: {}", status, body.trim()),
        },
    }
}

#[async_trait]
impl LanguageModel for ClaudeClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError> {
        let body = ClaudeRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            messages: vec![Message {
                role: "user",
                content: &request.prompt,
            }],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let claude_response = response.json::<ClaudeResponse>().await?;

        if let Some(usage) = &claude_response.usage {
            debug!(
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "Claude API usage"
            );
        }

        let text = claude_response
            .content
            .into_iter()
            .find_map(|c| c.text)
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(ModelError::EmptyResponse);
        }

        Ok(text)
    }
}
