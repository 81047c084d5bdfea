//! Client for OpenAI-compatible chat-completion APIs.
//!
//! Talks to `{base_url}/models` and `{base_url}/chat/completions` with a
//! bearer token. Streamed completions are decoded from SSE into
//! [`CompletionDelta`]s as the bytes arrive.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::sse::{SseDecoder, SseEvent};
use super::{
    bare_model_id, match_alias, BackendError, ChatBackend, ChatMessage, Choice, Completion,
    CompletionDelta, DeltaStream, ModelDetails, ModelInfo, ShowResponse, Usage,
};
use crate::config::BackendConfig;

// ─── Wire Types ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<RemoteModel>,
}

#[derive(Debug, Clone, Deserialize)]
struct RemoteModel {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    context_length: Option<u64>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ResponseChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

// ─── Client ────────────────────────────────────────────────────────────────

/// OpenAI-compatible backend. Cheap to clone; share one per process.
#[derive(Clone)]
pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    request_timeout: Duration,
}

impl OpenAiBackend {
    pub fn new(config: &BackendConfig, api_key: impl Into<String>) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn fetch_catalog(&self) -> Result<Vec<RemoteModel>, BackendError> {
        let response = self
            .client
            .get(self.url("models"))
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .send()
            .await?;
        let response = check_status(response).await?;
        let models: ModelsResponse = serde_json::from_slice(&response.bytes().await?)?;
        debug!(count = models.data.len(), "Fetched backend catalog");
        Ok(models.data)
    }

    async fn send_chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
        stream: bool,
    ) -> Result<reqwest::Response, BackendError> {
        let body = ChatCompletionRequest {
            model,
            messages,
            stream,
        };
        let mut request = self
            .client
            .post(self.url("chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&body);
        // A streamed body may legitimately outlive the request timeout.
        if !stream {
            request = request.timeout(self.request_timeout);
        }
        check_status(request.send().await?).await
    }
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, BackendError> {
        Ok(self.fetch_catalog().await?.iter().map(to_model_info).collect())
    }

    async fn model_details(&self, name: &str) -> Result<ShowResponse, BackendError> {
        let catalog = self.fetch_catalog().await?;
        let full_id = match_alias(name, catalog.iter().map(|m| m.id.as_str()))
            .ok_or_else(|| BackendError::ModelNotFound(name.to_string()))?;
        let model = catalog
            .iter()
            .find(|m| m.id == full_id)
            .ok_or_else(|| BackendError::ModelNotFound(name.to_string()))?;
        Ok(to_show_response(model))
    }

    async fn resolve_model(&self, alias: &str) -> Result<String, BackendError> {
        let catalog = self.fetch_catalog().await?;
        match_alias(alias, catalog.iter().map(|m| m.id.as_str()))
            .map(str::to_string)
            .ok_or_else(|| BackendError::ModelNotFound(alias.to_string()))
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
    ) -> Result<Completion, BackendError> {
        let response = self.send_chat(messages, model, false).await?;
        let body: ChatCompletionResponse = serde_json::from_slice(&response.bytes().await?)?;
        if let Some(err) = body.error {
            return Err(BackendError::Api(err.message));
        }

        Ok(Completion {
            choices: body
                .choices
                .into_iter()
                .map(|c| Choice {
                    content: c.message.content.unwrap_or_default(),
                    finish_reason: c.finish_reason.filter(|r| !r.is_empty()),
                })
                .collect(),
            usage: body.usage.unwrap_or_default(),
        })
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        model: &str,
    ) -> Result<DeltaStream, BackendError> {
        let response = self.send_chat(messages, model, true).await?;
        Ok(decode_delta_stream(response.bytes_stream().boxed()))
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    warn!(status = status.as_u16(), body = %body, "Backend request failed");
    Err(BackendError::Status {
        status: status.as_u16(),
        body,
    })
}

// ─── Streaming ─────────────────────────────────────────────────────────────

struct DecodeState<E> {
    bytes: BoxStream<'static, Result<bytes::Bytes, E>>,
    decoder: SseDecoder,
    done: bool,
}

/// Turn a raw SSE byte stream into completion deltas.
///
/// `[DONE]` or the end of the body finishes the stream cleanly. An `error`
/// object inside a chunk, a transport error, or an undecodable chunk yields
/// one `Err` and then ends the stream.
pub(crate) fn decode_delta_stream<E>(
    bytes: BoxStream<'static, Result<bytes::Bytes, E>>,
) -> DeltaStream
where
    E: Into<BackendError> + Send + 'static,
{
    let state = DecodeState {
        bytes,
        decoder: SseDecoder::new(),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }

        loop {
            match st.decoder.next_event() {
                Some(SseEvent::Done) => return None,
                Some(SseEvent::Data(data)) => match parse_chunk(&data) {
                    Ok(Some(delta)) => return Some((Ok(delta), st)),
                    Ok(None) => continue,
                    Err(e) => {
                        st.done = true;
                        return Some((Err(e), st));
                    }
                },
                None => {}
            }

            match st.bytes.next().await {
                Some(Ok(chunk)) => st.decoder.push(&chunk),
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(e.into()), st));
                }
                None => return None,
            }
        }
    })
    .boxed()
}

/// `Ok(None)` for chunks without a choice (e.g. a trailing usage chunk).
fn parse_chunk(data: &str) -> Result<Option<CompletionDelta>, BackendError> {
    let chunk: ChatCompletionChunk = serde_json::from_str(data)?;
    if let Some(err) = chunk.error {
        return Err(BackendError::Api(err.message));
    }
    Ok(chunk.choices.into_iter().next().map(|choice| CompletionDelta {
        content: choice.delta.content.unwrap_or_default(),
        finish_reason: choice.finish_reason.filter(|r| !r.is_empty()),
    }))
}

// ─── Catalog Mapping ───────────────────────────────────────────────────────

fn provider_family(id: &str) -> String {
    match id.split_once('/') {
        Some((provider, _)) => provider.to_string(),
        None => "unknown".to_string(),
    }
}

fn model_details_for(model: &RemoteModel) -> ModelDetails {
    let family = provider_family(&model.id);
    ModelDetails {
        parent_model: String::new(),
        format: "gguf".to_string(),
        families: vec![family.clone()],
        family,
        parameter_size: String::new(),
        quantization_level: String::new(),
    }
}

fn to_model_info(model: &RemoteModel) -> ModelInfo {
    let modified_at = model
        .created
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(chrono::Utc::now)
        .to_rfc3339();

    ModelInfo {
        name: model.id.clone(),
        model: bare_model_id(&model.id).to_string(),
        modified_at,
        details: model_details_for(model),
    }
}

fn to_show_response(model: &RemoteModel) -> ShowResponse {
    let details = model_details_for(model);
    let mut model_info = serde_json::Map::new();
    model_info.insert("general.architecture".into(), details.family.clone().into());
    model_info.insert(
        "general.basename".into(),
        bare_model_id(&model.id).to_string().into(),
    );
    if let Some(name) = &model.name {
        model_info.insert("general.name".into(), name.clone().into());
    }
    if let Some(description) = &model.description {
        model_info.insert("general.description".into(), description.clone().into());
    }
    if let Some(ctx) = model.context_length {
        model_info.insert(format!("{}.context_length", details.family), ctx.into());
    }

    ShowResponse {
        modelfile: format!("FROM {}\n", model.id),
        parameters: String::new(),
        template: "{{ .Prompt }}".to_string(),
        details,
        model_info,
        capabilities: vec!["completion".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_stream(chunks: Vec<&'static str>) -> BoxStream<'static, Result<bytes::Bytes, BackendError>> {
        stream::iter(chunks.into_iter().map(|c| Ok(bytes::Bytes::from(c)))).boxed()
    }

    #[tokio::test]
    async fn test_decode_deltas_in_order() {
        let stream = decode_delta_stream(byte_stream(vec![
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"He\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"llo\"},\"finish_reason\":\"stop\"}]}\n\ndata: [DO",
            "NE]\n\n",
        ]));
        let deltas: Vec<_> = stream.collect().await;
        assert_eq!(deltas.len(), 2);
        let first = deltas[0].as_ref().unwrap();
        let second = deltas[1].as_ref().unwrap();
        assert_eq!(first.content, "He");
        assert_eq!(first.finish_reason, None);
        assert_eq!(second.content, "llo");
        assert_eq!(second.finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn test_usage_only_chunk_skipped() {
        let stream = decode_delta_stream(byte_stream(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":3}}\n\n",
        ]));
        let deltas: Vec<_> = stream.collect().await;
        assert_eq!(deltas.len(), 1);
    }

    #[tokio::test]
    async fn test_error_chunk_ends_stream() {
        let stream = decode_delta_stream(byte_stream(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n",
            "data: {\"error\":{\"message\":\"overloaded\"}}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"never\"}}]}\n\n",
        ]));
        let deltas: Vec<_> = stream.collect().await;
        assert_eq!(deltas.len(), 2);
        assert!(matches!(&deltas[1], Err(BackendError::Api(m)) if m == "overloaded"));
    }

    #[test]
    fn test_model_info_mapping() {
        let remote = RemoteModel {
            id: "openai/gpt-4o-mini".to_string(),
            name: Some("OpenAI: GPT-4o-mini".to_string()),
            created: Some(1_721_260_800),
            context_length: Some(128_000),
            description: None,
        };
        let info = to_model_info(&remote);
        assert_eq!(info.name, "openai/gpt-4o-mini");
        assert_eq!(info.model, "gpt-4o-mini");
        assert_eq!(info.details.family, "openai");
        assert!(info.modified_at.starts_with("2024-07-18"));

        let show = to_show_response(&remote);
        assert_eq!(show.model_info["openai.context_length"], 128_000);
        assert_eq!(show.modelfile, "FROM openai/gpt-4o-mini\n");
    }
}
