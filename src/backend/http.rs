//! OpenAI-compatible HTTP backends.
//!
//! These clients work with any OpenAI-compatible API endpoint, including
//! proxies. Transient failures (rate limits, server errors, timeouts)
//! surface as `BackendErrorKind::Transient` so the runner's retry loop
//! can tell them apart from auth/request errors.

use crate::backend::{Completion, EmbeddingBackend, ModelBackend, ModelParams, TokenUsage};
use crate::config::BackendConfig;
use crate::error::{HarnessError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Request body for chat completion.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

/// Response from chat completion.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// OpenAI API error response.
#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Classify an HTTP status into the retry taxonomy.
fn status_error(status: StatusCode, body: &str) -> HarnessError {
    let message = match serde_json::from_str::<ApiError>(body) {
        Ok(api_error) => format!("API error ({}): {}", status, api_error.error.message),
        Err(_) => format!("Request failed ({}): {}", status, body),
    };

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        HarnessError::transient(message)
    } else {
        HarnessError::fatal(message)
    }
}

fn build_client(config: &BackendConfig) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .unwrap_or_default()
}

/// Chat-completion backend over an OpenAI-compatible endpoint.
#[derive(Clone)]
pub struct HttpModelBackend {
    client: Client,
    config: BackendConfig,
}

impl HttpModelBackend {
    /// Create a new model backend with the given configuration.
    pub fn new(config: BackendConfig) -> Self {
        Self {
            client: build_client(&config),
            config,
        }
    }

    fn endpoint(&self) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        format!("{}/v1/chat/completions", base)
    }
}

#[async_trait]
impl ModelBackend for HttpModelBackend {
    async fn complete(
        &self,
        prompt: &str,
        model_id: &str,
        params: &ModelParams,
    ) -> Result<Completion> {
        let request = ChatCompletionRequest {
            model: model_id,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
            max_tokens: Some(params.max_tokens),
            temperature: Some(params.temperature),
        };

        let start = Instant::now();
        let response = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        let latency_ms = start.elapsed().as_millis() as u64;

        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        let completion: ChatCompletionResponse = serde_json::from_str(&body)?;

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| HarnessError::fatal("No choices in response"))?;

        Ok(Completion {
            text: choice.message.content,
            usage: completion
                .usage
                .map(|u| TokenUsage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
                })
                .unwrap_or_default(),
            latency_ms,
        })
    }
}

/// Request body for embeddings.
#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// Embedding backend over an OpenAI-compatible endpoint.
#[derive(Clone)]
pub struct HttpEmbeddingBackend {
    client: Client,
    config: BackendConfig,
}

impl HttpEmbeddingBackend {
    /// Create a new embedding backend with the given configuration.
    pub fn new(config: BackendConfig) -> Self {
        Self {
            client: build_client(&config),
            config,
        }
    }

    fn endpoint(&self) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        format!("{}/v1/embeddings", base)
    }
}

#[async_trait]
impl EmbeddingBackend for HttpEmbeddingBackend {
    async fn embed(&self, texts: &[String], model_id: &str) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest {
            model: model_id,
            input: texts,
        };

        let response = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        let mut parsed: EmbeddingResponse = serde_json::from_str(&body)?;
        parsed.data.sort_by_key(|entry| entry.index);

        if parsed.data.len() != texts.len() {
            return Err(HarnessError::fatal(format!(
                "Backend returned {} embeddings for {} inputs",
                parsed.data.len(),
                texts.len()
            )));
        }

        Ok(parsed.data.into_iter().map(|e| e.embedding).collect())
    }
}
