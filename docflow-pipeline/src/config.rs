//! Pipeline configuration.
//!
//! Loaded from a TOML file; every field has a default so a minimal config
//! (or none at all) still yields a runnable pipeline against the embedded
//! sink. Only options that change core behavior live here: the embedding
//! concurrency limit and batch size, the per-call timeout, the chosen
//! vector backend and the watched directory.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which vector sink backend the deployment uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkBackend {
    /// Local SQLite vector store
    Embedded,
    /// External RediSearch server
    Redis,
    /// Remote assistant-file vector store
    Assistant,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// Base URL of the embedding service (up to `/v1`)
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key, if the service needs one
    pub api_key_env: Option<String>,
    /// Expected embedding dimension, validated when set
    pub dimension: Option<usize>,
    /// Chunks per embedding request
    pub batch_size: usize,
    /// Maximum simultaneous in-flight embedding requests
    pub concurrency: usize,
    /// Hard deadline per embedding request, seconds
    pub timeout_secs: u64,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_key_env: None,
            dimension: None,
            batch_size: 128,
            concurrency: 5,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingSettings {
    /// Resolve the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChunkingSettings {
    /// Per-chunk token target once a paragraph needs splitting
    pub target_tokens: usize,
    /// Token ceiling above which a paragraph is split at all
    pub max_tokens: usize,
    /// Crude chars-per-token ratio for the estimator
    pub chars_per_token: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            target_tokens: 256,
            max_tokens: 1024,
            chars_per_token: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkSettings {
    pub backend: SinkBackend,
    pub redis_url: String,
    pub assistant_base_url: String,
    /// Environment variable holding the assistant-store API key
    pub assistant_api_key_env: String,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            backend: SinkBackend::Embedded,
            redis_url: "redis://localhost:6379".to_string(),
            assistant_base_url: "https://api.openai.com/v1".to_string(),
            assistant_api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory watched for incoming documents
    pub files_dir: PathBuf,
    /// Directory for the registry database and the embedded vector store
    pub data_dir: PathBuf,
    /// Root of the telemetry streams
    pub telemetry_dir: PathBuf,
    /// File extensions the watcher picks up
    pub watch_extensions: Vec<String>,
    /// Debounce window for filesystem events, milliseconds
    pub watch_debounce_millis: u64,
    /// Idle delay between worker polling passes, seconds
    pub poll_interval_secs: u64,
    /// Grace period for workers to stop at shutdown, seconds
    pub shutdown_timeout_secs: u64,
    pub embedding: EmbeddingSettings,
    pub chunking: ChunkingSettings,
    pub sink: SinkSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            files_dir: PathBuf::from("files"),
            data_dir: PathBuf::from("data"),
            telemetry_dir: PathBuf::from("telemetry"),
            watch_extensions: vec!["pdf".to_string(), "txt".to_string(), "md".to_string()],
            watch_debounce_millis: 500,
            poll_interval_secs: 3,
            shutdown_timeout_secs: 10,
            embedding: EmbeddingSettings::default(),
            chunking: ChunkingSettings::default(),
            sink: SinkSettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config file {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Malformed config file {}", path.display()))?;
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_millis)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
