//! In-memory backend shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use futures::stream;
use http_body_util::BodyExt;

use ollama_router_proxy::backend::{
    bare_model_id, match_alias, BackendError, ChatBackend, ChatMessage, Choice, Completion,
    CompletionDelta, DeltaStream, ModelDetails, ModelInfo, ShowResponse, Usage,
};

/// Scripted streaming item.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Delta(&'static str, Option<&'static str>),
    Fail(&'static str),
}

/// Sets its flag when dropped.
pub struct DropFlag(pub Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeBackend {
    pub ids: Vec<String>,
    pub fail_catalog: bool,
    pub choices: Vec<Choice>,
    pub usage: Usage,
    pub stream: Vec<StreamItem>,
    pub calls: AtomicUsize,
    pub last_messages: Mutex<Vec<ChatMessage>>,
    pub last_model: Mutex<Option<String>>,
    /// `chat` never returns; `chat_dropped` flips once the call is abandoned.
    pub hang_chat: bool,
    pub chat_dropped: Arc<AtomicBool>,
}

impl FakeBackend {
    pub fn with_ids(ids: &[&str]) -> Self {
        Self {
            ids: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn record(&self, messages: &[ChatMessage], model: &str) {
        *self.last_messages.lock().unwrap() = messages.to_vec();
        *self.last_model.lock().unwrap() = Some(model.to_string());
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_catalog {
            return Err(BackendError::Status {
                status: 401,
                body: "invalid api key".to_string(),
            });
        }
        Ok(self
            .ids
            .iter()
            .map(|id| ModelInfo {
                name: id.clone(),
                model: bare_model_id(id).to_string(),
                modified_at: "2024-07-18T00:00:00+00:00".to_string(),
                details: ModelDetails::default(),
            })
            .collect())
    }

    async fn model_details(&self, name: &str) -> Result<ShowResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let id = match_alias(name, self.ids.iter().map(String::as_str))
            .ok_or_else(|| BackendError::ModelNotFound(name.to_string()))?;
        Ok(ShowResponse {
            modelfile: format!("FROM {id}\n"),
            parameters: String::new(),
            template: String::new(),
            details: ModelDetails::default(),
            model_info: serde_json::Map::new(),
            capabilities: vec!["completion".to_string()],
        })
    }

    async fn resolve_model(&self, alias: &str) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match_alias(alias, self.ids.iter().map(String::as_str))
            .map(str::to_string)
            .ok_or_else(|| BackendError::ModelNotFound(alias.to_string()))
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
    ) -> Result<Completion, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.record(messages, model);
        if self.hang_chat {
            let _guard = DropFlag(self.chat_dropped.clone());
            futures::future::pending::<()>().await;
        }
        Ok(Completion {
            choices: self.choices.clone(),
            usage: self.usage,
        })
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        model: &str,
    ) -> Result<DeltaStream, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.record(messages, model);
        let items: Vec<Result<CompletionDelta, BackendError>> = self
            .stream
            .iter()
            .map(|item| match item {
                StreamItem::Delta(content, finish) => Ok(CompletionDelta {
                    content: content.to_string(),
                    finish_reason: finish.map(str::to_string),
                }),
                StreamItem::Fail(msg) => Err(BackendError::Api(msg.to_string())),
            })
            .collect();
        Ok(Box::pin(stream::iter(items)))
    }
}

pub fn json_request(method: &str, uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

pub fn shared(backend: FakeBackend) -> Arc<FakeBackend> {
    Arc::new(backend)
}
