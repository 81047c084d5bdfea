//! HTTP server emulating the Ollama REST API.
//!
//! - [`ollama_api`]: Request/response types and route handlers
//! - [`streaming`]: NDJSON streaming for token-by-token responses
//! - [`lifecycle`]: Start/stop control with graceful drain

pub mod lifecycle;
pub mod ollama_api;
pub mod streaming;
