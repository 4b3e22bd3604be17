//! Pluggable model and embedding backends.
//!
//! Backends are capability contracts: `complete` for chat models,
//! `embed` for embedding models. Each concrete backend is a standalone
//! implementation selected by configuration; the harness never branches
//! on provider identity outside this module.

pub mod http;

pub use http::{HttpEmbeddingBackend, HttpModelBackend};

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Token usage reported by a model call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Result of a single model completion call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    /// Raw response text.
    pub text: String,
    /// Token usage (zeroed when the backend does not report it).
    pub usage: TokenUsage,
    /// Wall-clock latency of the call.
    pub latency_ms: u64,
}

/// Generation parameters passed through to the backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelParams {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.0,
        }
    }
}

/// A chat-completion backend.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Send one rendered prompt to one model.
    async fn complete(
        &self,
        prompt: &str,
        model_id: &str,
        params: &ModelParams,
    ) -> Result<Completion>;
}

/// An embedding backend.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed(&self, texts: &[String], model_id: &str) -> Result<Vec<Vec<f32>>>;
}
