//! Ollama-compatible HTTP API.
//!
//! Implements the subset of the Ollama REST surface that chat clients use:
//! - GET/HEAD /
//! - GET /api/version
//! - GET /api/tags
//! - POST /api/show
//! - POST /api/chat

use std::future::Future;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{BackendError, ChatBackend, ChatMessage, ModelDetails, ModelInfo};
use crate::error::ProxyError;
use crate::filter::ModelFilter;
use crate::server::streaming::ndjson_chat_stream;

/// Plain-text body of the root probe; Ollama tooling matches on it.
pub const ROOT_RESPONSE: &str = "Ollama is running";

/// Version reported on `/api/version`. Some clients refuse anything older.
pub const OLLAMA_VERSION: &str = "0.6.4";

/// Placeholder size for listing entries. There is no local blob to measure.
pub const PLACEHOLDER_SIZE: u64 = 270_898_672;

/// Placeholder digest for listing entries. There is no local blob to hash.
pub const PLACEHOLDER_DIGEST: &str =
    "9077fe9d2ae1a4a41a868836b56b8163731a8fe16621397028c2c76f838c6907";

/// Nanoseconds per token used to fake `total_duration` and `eval_duration`.
///
/// These fields are display-only approximations derived from token counts,
/// not measured latency.
pub const APPROX_NANOS_PER_TOKEN: u64 = 10;

/// Finish reason reported when the backend omits one.
pub const DEFAULT_FINISH_REASON: &str = "stop";

/// Application state shared across handlers.
pub struct AppState {
    pub backend: Arc<dyn ChatBackend>,
    pub filter: Arc<ModelFilter>,
    /// Cancelled once the shutdown grace period runs out; ends open streams.
    pub force_close: CancellationToken,
}

impl AppState {
    pub fn new(backend: Arc<dyn ChatBackend>, filter: ModelFilter) -> Self {
        Self {
            backend,
            filter: Arc::new(filter),
            force_close: CancellationToken::new(),
        }
    }

    /// Run `work` unless the server force-closes first, in which case the
    /// work is dropped along with any backend call it was waiting on.
    pub async fn until_force_close<T, F>(&self, work: F) -> Result<T, ProxyError>
    where
        F: Future<Output = Result<T, ProxyError>>,
    {
        tokio::select! {
            biased;
            _ = self.force_close.cancelled() => {
                warn!("Server shutting down, abandoning in-flight request");
                Err(ProxyError::ShuttingDown)
            }
            result = work => result,
        }
    }
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root).head(root_head))
        .route("/api/version", get(version))
        .route("/api/tags", get(list_tags))
        .route("/api/show", post(show_model))
        .route("/api/chat", post(chat))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
}

/// One model in `/api/tags`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingEntry {
    pub name: String,
    pub model: String,
    pub modified_at: String,
    pub size: u64,
    pub digest: String,
    pub details: ModelDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TagsResponse {
    pub models: Vec<ListingEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ShowRequest {
    #[serde(default)]
    pub name: Option<String>,
}

/// Chat request in Ollama's shape.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// Ollama streams unless told otherwise.
    #[serde(default)]
    pub stream: Option<bool>,
}

impl ChatRequest {
    pub fn wants_stream(&self) -> bool {
        self.stream.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub role: String,
    pub content: String,
}

impl ResponseMessage {
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Chat response object. Streaming frames and the terminal frame share it;
/// only terminal frames carry the finish reason and timing fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub model: String,
    pub created_at: String,
    pub message: ResponseMessage,
    pub done: bool,
    #[serde(flatten)]
    pub summary: Option<DoneSummary>,
}

/// Fields that only appear on the `done: true` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneSummary {
    pub finish_reason: String,
    pub total_duration: u64,
    pub load_duration: u64,
    pub prompt_eval_count: u64,
    pub eval_count: u64,
    pub eval_duration: u64,
}

impl DoneSummary {
    /// Summary with zeroed counters, as sent at the end of a stream.
    pub fn finished(finish_reason: impl Into<String>) -> Self {
        Self {
            finish_reason: finish_reason.into(),
            ..Default::default()
        }
    }

    /// Summary with durations approximated from token counts.
    pub fn from_usage(finish_reason: impl Into<String>, usage: crate::backend::Usage) -> Self {
        Self {
            finish_reason: finish_reason.into(),
            total_duration: usage.total_tokens * APPROX_NANOS_PER_TOKEN,
            load_duration: 0,
            prompt_eval_count: usage.prompt_tokens,
            eval_count: usage.completion_tokens,
            eval_duration: usage.completion_tokens * APPROX_NANOS_PER_TOKEN,
        }
    }
}

impl ChatResponse {
    /// Intermediate (`done: false`) frame carrying one content fragment.
    pub fn partial(model: &str, content: impl Into<String>) -> Self {
        Self {
            model: model.to_string(),
            created_at: now_rfc3339(),
            message: ResponseMessage::assistant(content),
            done: false,
            summary: None,
        }
    }

    /// Terminal (`done: true`) frame.
    pub fn finished(model: &str, content: impl Into<String>, summary: DoneSummary) -> Self {
        Self {
            model: model.to_string(),
            created_at: now_rfc3339(),
            message: ResponseMessage::assistant(content),
            done: true,
            summary: Some(summary),
        }
    }
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

// ─── Catalog ───────────────────────────────────────────────────────────────

/// Apply the filter and decorate each entry, preserving backend order.
pub fn build_listing(models: Vec<ModelInfo>, filter: &ModelFilter) -> Vec<ListingEntry> {
    models
        .into_iter()
        .filter(|m| filter.allows(&m.model))
        .map(|m| ListingEntry {
            name: m.name,
            model: m.model,
            modified_at: m.modified_at,
            size: PLACEHOLDER_SIZE,
            digest: PLACEHOLDER_DIGEST.to_string(),
            details: m.details,
        })
        .collect()
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn root() -> &'static str {
    ROOT_RESPONSE
}

async fn root_head() -> StatusCode {
    StatusCode::OK
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: OLLAMA_VERSION.to_string(),
    })
}

async fn list_tags(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TagsResponse>, ProxyError> {
    let models = state
        .until_force_close(async {
            state.backend.list_models().await.map_err(|e| {
                error!(error = %e, "Error getting models");
                ProxyError::backend(e)
            })
        })
        .await?;

    let total = models.len();
    let models = build_listing(models, &state.filter);
    debug!(total, listed = models.len(), "GET /api/tags");

    Ok(Json(TagsResponse { models }))
}

async fn show_model(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let request: ShowRequest = serde_json::from_slice(&body)
        .map_err(|_| ProxyError::BadRequest("Invalid JSON payload".to_string()))?;

    let name = match request.name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => return Err(ProxyError::BadRequest("Model name is required".to_string())),
    };
    debug!(model = %name, "POST /api/show");

    let details = state
        .until_force_close(async {
            state.backend.model_details(&name).await.map_err(|e| {
                error!(model = %name, error = %e, "Error getting model details");
                ProxyError::backend(e)
            })
        })
        .await?;

    Ok(Json(details).into_response())
}

async fn chat(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Response, ProxyError> {
    let request: ChatRequest = serde_json::from_slice(&body)
        .map_err(|_| ProxyError::BadRequest("Invalid JSON payload".to_string()))?;

    let request_id = Uuid::new_v4().to_string();
    let stream = request.wants_stream();

    info!(
        request_id = request_id,
        model = request.model,
        messages = request.messages.len(),
        stream,
        "Chat request"
    );

    if stream {
        // Once the body is handed to axum, the relay watches the token itself.
        state
            .until_force_close(respond_stream(&state, request, &request_id))
            .await
    } else {
        let response = state
            .until_force_close(respond_once(
                state.backend.as_ref(),
                &request.messages,
                &request.model,
            ))
            .await?;
        Ok(Json(response).into_response())
    }
}

/// Resolve `alias`, logging failures. Not-found stays distinguishable.
async fn resolve(backend: &dyn ChatBackend, alias: &str) -> Result<String, ProxyError> {
    backend.resolve_model(alias).await.map_err(|e| {
        error!(model = alias, error = %e, "Error getting full model name");
        ProxyError::from(e)
    })
}

/// One blocking backend call, answered with a single `done: true` object.
pub async fn respond_once(
    backend: &dyn ChatBackend,
    messages: &[ChatMessage],
    alias: &str,
) -> Result<ChatResponse, ProxyError> {
    let full_model = resolve(backend, alias).await?;

    let completion = backend.chat(messages, &full_model).await.map_err(|e| {
        error!(model = %full_model, error = %e, "Failed to get chat response");
        ProxyError::backend(e)
    })?;

    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProxyError::backend(BackendError::EmptyResponse))?;

    let finish_reason = choice
        .finish_reason
        .unwrap_or_else(|| DEFAULT_FINISH_REASON.to_string());

    Ok(ChatResponse::finished(
        &full_model,
        choice.content,
        DoneSummary::from_usage(finish_reason, completion.usage),
    ))
}

/// Open a backend stream and relay it as NDJSON.
///
/// Errors before the first byte is sent become ordinary status codes; errors
/// afterwards are reported in-band by the stream itself.
async fn respond_stream(
    state: &AppState,
    request: ChatRequest,
    request_id: &str,
) -> Result<Response, ProxyError> {
    let full_model = resolve(state.backend.as_ref(), &request.model).await?;
    info!(request_id, model = %full_model, "Using model");

    let deltas = state
        .backend
        .chat_stream(&request.messages, &full_model)
        .await
        .map_err(|e| {
            error!(request_id, error = %e, "Failed to create stream");
            ProxyError::backend(e)
        })?;

    let body = Body::from_stream(ndjson_chat_stream(
        deltas,
        full_model,
        request_id.to_string(),
        state.force_close.child_token(),
    ));

    Ok((
        [
            (header::CONTENT_TYPE, "application/x-ndjson"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        body,
    )
        .into_response())
}
