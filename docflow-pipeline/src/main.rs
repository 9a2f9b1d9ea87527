//! Pipeline daemon: wires the registry, sink, embedding provider and
//! workers together, then runs until ctrl-c.

use anyhow::{Context, Result};
use clap::Parser;
use docflow_embed::{EmbedConfig, HttpEmbeddingProvider};
use docflow_pipeline::chunker::CharsPerToken;
use docflow_pipeline::config::{PipelineConfig, SinkBackend};
use docflow_pipeline::extract::PlainTextExtractor;
use docflow_pipeline::registry::FileRegistry;
use docflow_pipeline::sink::{
    AssistantVectorStore, EmbeddedVectorStore, RedisVectorSink, VectorSink,
};
use docflow_pipeline::telemetry::{TeleWriter, TelemetryScope};
use docflow_pipeline::workers::{
    ExtractionWorker, IndexingConfig, IndexingWorker, IngestWatcher, WorkerSupervisor,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "docflow-pipeline", about = "Document ingestion & vector indexing pipeline")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the watched directory from the config
    #[arg(long)]
    files_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(files_dir) = args.files_dir {
        config.files_dir = files_dir;
    }

    tokio::fs::create_dir_all(&config.files_dir)
        .await
        .with_context(|| format!("Cannot create files dir {}", config.files_dir.display()))?;
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("Cannot create data dir {}", config.data_dir.display()))?;

    let registry = FileRegistry::open(&config.data_dir.join("registry.db")).await?;
    let sink = build_sink(&config).await?;
    info!("Using {} vector sink", sink.backend_name());

    let mut embed_config = EmbedConfig::new(
        config.embedding.endpoint.clone(),
        config.embedding.model.clone(),
    );
    if let Some(key) = config.embedding.api_key() {
        embed_config = embed_config.with_api_key(key);
    }
    if let Some(dimension) = config.embedding.dimension {
        embed_config = embed_config.with_dimension(dimension);
    }
    let provider = Arc::new(HttpEmbeddingProvider::new(embed_config)?);

    let mut supervisor = WorkerSupervisor::new();

    let watcher = IngestWatcher::new(
        registry.clone(),
        config.files_dir.clone(),
        config.watch_extensions.clone(),
    );
    supervisor.register(watcher.spawn(config.watch_debounce())?);

    let extractor = ExtractionWorker::new(
        registry.clone(),
        Arc::new(PlainTextExtractor),
        config.files_dir.clone(),
        TeleWriter::new(&config.telemetry_dir, TelemetryScope::Extractor),
        config.poll_interval(),
    );
    supervisor.register(extractor.spawn());

    let indexing_config = IndexingConfig::default()
        .with_batch_size(config.embedding.batch_size)
        .with_concurrency(config.embedding.concurrency)
        .with_embed_timeout(Duration::from_secs(config.embedding.timeout_secs))
        .with_chunk_tokens(config.chunking.target_tokens, config.chunking.max_tokens);
    let indexer = IndexingWorker::new(
        registry.clone(),
        sink,
        provider,
        Arc::new(CharsPerToken::new(config.chunking.chars_per_token)),
        config.files_dir.clone(),
        TeleWriter::new(&config.telemetry_dir, TelemetryScope::Indexer),
        indexing_config,
    );
    supervisor.register(indexer.spawn());

    info!("Pipeline started; watching {}", config.files_dir.display());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received, stopping workers");
    supervisor.stop_all(config.shutdown_timeout()).await;
    info!("Pipeline stopped");
    Ok(())
}

async fn build_sink(config: &PipelineConfig) -> Result<Arc<dyn VectorSink>> {
    let sink: Arc<dyn VectorSink> = match config.sink.backend {
        SinkBackend::Embedded => {
            Arc::new(EmbeddedVectorStore::open(&config.data_dir.join("vectors.db")).await?)
        }
        SinkBackend::Redis => Arc::new(RedisVectorSink::connect(&config.sink.redis_url).await?),
        SinkBackend::Assistant => {
            let api_key = std::env::var(&config.sink.assistant_api_key_env).with_context(|| {
                format!(
                    "Assistant sink needs the {} environment variable",
                    config.sink.assistant_api_key_env
                )
            })?;
            Arc::new(AssistantVectorStore::new(
                config.sink.assistant_base_url.clone(),
                api_key,
            )?)
        }
    };
    Ok(sink)
}
