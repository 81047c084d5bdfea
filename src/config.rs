//! Runtime configuration for ollama-router-proxy.
//!
//! Configuration is loaded from a JSON file and then overridden by command-line
//! flags and environment variables. The file is only ever read, never written.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "ollama-router-proxy",
    about = "Ollama-compatible proxy for OpenAI-style chat backends"
)]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Path to the model filter file (overrides the config file).
    #[arg(long)]
    pub filter: Option<PathBuf>,

    /// Backend base URL (overrides the config file).
    #[arg(long)]
    pub base_url: Option<String>,

    /// Backend API key.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener and shutdown settings.
    pub server: ServerConfig,

    /// Remote chat-completion backend.
    pub backend: BackendConfig,

    /// Model allow-list.
    pub filter: FilterConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind, e.g. "0.0.0.0:11434".
    pub listen: String,

    /// Grace period for in-flight requests on shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // Ollama's well-known port.
            listen: "0.0.0.0:11434".to_string(),
            shutdown_timeout_secs: 5,
        }
    }
}

/// Backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the OpenAI-compatible API, without a trailing slash.
    pub base_url: String,

    /// Bearer token sent with every backend request.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    /// Per-request timeout in seconds. Streamed chat bodies are exempt.
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key: None,
            request_timeout_secs: 120,
        }
    }
}

/// Model filter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Newline-separated list of bare model ids. A missing file disables filtering.
    pub path: PathBuf,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("models-filter"),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line overrides on top of the file configuration.
    pub fn apply_cli(mut self, cli: &Cli) -> Self {
        if let Some(listen) = &cli.listen {
            self.server.listen = listen.clone();
        }
        if let Some(filter) = &cli.filter {
            self.filter.path = filter.clone();
        }
        if let Some(base_url) = &cli.base_url {
            self.backend.base_url = base_url.clone();
        }
        if let Some(api_key) = &cli.api_key {
            self.backend.api_key = Some(api_key.clone());
        }
        self.backend.base_url = self.backend.base_url.trim_end_matches('/').to_string();
        self
    }

    /// The API key, or an error naming how to provide one.
    pub fn require_api_key(&self) -> anyhow::Result<&str> {
        match self.backend.api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => Ok(key),
            _ => anyhow::bail!(
                "no backend API key configured; pass --api-key or set OPENAI_API_KEY"
            ),
        }
    }
}
