//! ollama-router-proxy: Ollama-compatible front end for remote chat backends.
//!
//! Serves the Ollama REST surface (`/api/tags`, `/api/show`, `/api/chat`)
//! and relays inference to an OpenAI-style chat-completion API such as
//! OpenRouter, translating requests, whole responses and streamed deltas
//! between the two schemas. An optional allow-list file limits which
//! backend models are advertised.

pub mod backend;
pub mod config;
pub mod error;
pub mod filter;
pub mod server;
