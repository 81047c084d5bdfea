//! Remote chat-completion backend.
//!
//! - [`openai`]: reqwest client for OpenAI-compatible APIs (OpenRouter by default)
//! - [`sse`]: Server-Sent Events decoder for streamed completions
//!
//! Route handlers only talk to the [`ChatBackend`] trait, so tests can swap in
//! an in-memory backend.

pub mod openai;
pub mod sse;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub use openai::OpenAiBackend;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("model '{0}' not found")]
    ModelNotFound(String),

    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode backend response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    Api(String),

    #[error("No response from model")]
    EmptyResponse,
}

/// One chat message. Passed through to the backend unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    /// `null` is read as an empty string.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Model details in Ollama's shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelDetails {
    #[serde(default)]
    pub parent_model: String,
    pub format: String,
    pub family: String,
    #[serde(default)]
    pub families: Vec<String>,
    pub parameter_size: String,
    pub quantization_level: String,
}

/// One catalog entry as advertised by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Display name; may carry the provider prefix.
    pub name: String,
    /// Bare id used for filter matching.
    pub model: String,
    pub modified_at: String,
    pub details: ModelDetails,
}

/// Response body for Ollama's `/api/show`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShowResponse {
    pub modelfile: String,
    pub parameters: String,
    pub template: String,
    pub details: ModelDetails,
    pub model_info: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Token accounting reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Choice {
    pub content: String,
    pub finish_reason: Option<String>,
}

/// A whole (non-streamed) completion.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

/// One incremental unit of a streamed completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionDelta {
    pub content: String,
    pub finish_reason: Option<String>,
}

/// Lazy, finite sequence of deltas. Ends with `None` on a clean end-of-stream;
/// dropping it releases the underlying connection.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<CompletionDelta, BackendError>> + Send>>;

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Full catalog, in backend order.
    async fn list_models(&self) -> Result<Vec<ModelInfo>, BackendError>;

    async fn model_details(&self, name: &str) -> Result<ShowResponse, BackendError>;

    /// Map a short alias to the backend's fully-qualified id.
    ///
    /// Fails with [`BackendError::ModelNotFound`] when nothing matches.
    async fn resolve_model(&self, alias: &str) -> Result<String, BackendError>;

    async fn chat(&self, messages: &[ChatMessage], model: &str)
        -> Result<Completion, BackendError>;

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        model: &str,
    ) -> Result<DeltaStream, BackendError>;
}

/// Segment after the last `/`, e.g. `openai/gpt-4o-mini` -> `gpt-4o-mini`.
pub fn bare_model_id(id: &str) -> &str {
    id.rsplit('/').next().unwrap_or(id)
}

/// Find the full id an alias refers to.
///
/// An alias matches a full id exactly, or matches its bare id. A trailing
/// `:latest` tag on the alias is ignored since Ollama clients append it.
pub fn match_alias<'a, I>(alias: &str, ids: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let alias = alias.trim();
    let alias = alias.strip_suffix(":latest").unwrap_or(alias);
    if alias.is_empty() {
        return None;
    }

    let mut bare_hit = None;
    for id in ids {
        if id == alias {
            return Some(id);
        }
        if bare_hit.is_none() && bare_model_id(id) == alias {
            bare_hit = Some(id);
        }
    }
    bare_hit
}
