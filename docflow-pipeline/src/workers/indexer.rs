//! Indexing worker: the core per-file state machine.
//!
//! Claims files in `Extracted`/`Incomplete`, recomputes the dedup set from
//! the sink, chunks and embeds the remainder under a bounded semaphore and
//! writes the vectors back. Because dedup is recomputed from the sink
//! itself (never from local bookkeeping), a crash anywhere between writing
//! vectors and recording status converges on the next pass instead of
//! double-writing.
//!
//! Per-file pass:
//! 1. mark `Processing` (after re-checking the claim)
//! 2. load the paragraph artifact; missing artifact is terminal
//! 3. to-do set = paragraphs whose id the sink does not hold yet
//! 4. split to-do paragraphs into token-bounded chunks
//! 5. embed chunk batches concurrently, capped by the semaphore, each
//!    batch under a hard timeout; a failed batch aborts only its own chunks
//! 6. lazily ensure the sink collection, sized from the first embedding
//! 7. upsert everything that embedded
//! 8. `Complete` iff nothing failed, else `Incomplete`
//! 9. emit a telemetry record either way

use super::WorkerHandle;
use crate::chunker::{chunk_text, TokenEstimator};
use crate::paragraph::{paragraph_file_path, read_paragraphs, ParagraphRecord, ParagraphVector};
use crate::registry::{FileRecord, FileRegistry, ProcessingStatus};
use crate::sink::VectorSink;
use crate::telemetry::{EventStatus, TeleWriter, TelemetryEvent};
use anyhow::{Context, Result};
use docflow_embed::EmbeddingProvider;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Tuning knobs for the indexing worker.
#[derive(Debug, Clone)]
pub struct IndexingConfig {
    /// Chunks per embedding request
    pub batch_size: usize,
    /// Maximum simultaneous in-flight embedding requests
    pub concurrency: usize,
    /// Hard deadline per embedding request
    pub embed_timeout: Duration,
    /// Per-chunk token target once a paragraph needs splitting
    pub chunk_target_tokens: usize,
    /// Token ceiling above which a paragraph is split at all
    pub chunk_max_tokens: usize,
    /// Idle delay between polling passes
    pub poll_interval: Duration,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            concurrency: 5,
            embed_timeout: Duration::from_secs(30),
            chunk_target_tokens: 256,
            chunk_max_tokens: 1024,
            poll_interval: Duration::from_secs(3),
        }
    }
}

impl IndexingConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout = timeout;
        self
    }

    pub fn with_chunk_tokens(mut self, target: usize, max: usize) -> Self {
        self.chunk_target_tokens = target;
        self.chunk_max_tokens = max;
        self
    }
}

/// Counters for one indexing pass over one file.
#[derive(Debug, Default, Clone)]
struct PassStats {
    paragraphs_total: usize,
    paragraphs_skipped: usize,
    chunks_total: usize,
    chunks_embedded: usize,
    chunks_failed: usize,
    chunks_written: usize,
    batches_total: usize,
    batches_failed: usize,
}

impl PassStats {
    fn fully_indexed(&self) -> bool {
        self.batches_failed == 0
    }

    fn as_attributes(&self) -> serde_json::Value {
        serde_json::json!({
            "paragraphs_total": self.paragraphs_total,
            "paragraphs_skipped": self.paragraphs_skipped,
            "chunks_total": self.chunks_total,
            "chunks_embedded": self.chunks_embedded,
            "chunks_failed": self.chunks_failed,
            "chunks_written": self.chunks_written,
            "batches_total": self.batches_total,
            "batches_failed": self.batches_failed,
        })
    }
}

pub struct IndexingWorker {
    registry: FileRegistry,
    sink: Arc<dyn VectorSink>,
    provider: Arc<dyn EmbeddingProvider>,
    estimator: Arc<dyn TokenEstimator>,
    files_dir: PathBuf,
    tele: TeleWriter,
    config: IndexingConfig,
}

impl IndexingWorker {
    pub fn new(
        registry: FileRegistry,
        sink: Arc<dyn VectorSink>,
        provider: Arc<dyn EmbeddingProvider>,
        estimator: Arc<dyn TokenEstimator>,
        files_dir: PathBuf,
        tele: TeleWriter,
        config: IndexingConfig,
    ) -> Self {
        Self {
            registry,
            sink,
            provider,
            estimator,
            files_dir,
            tele,
            config,
        }
    }

    /// One polling pass: index every file currently claimable.
    ///
    /// Returns the number of files handled. Per-file outcomes land in each
    /// file's status; only registry access trouble surfaces as `Err`.
    pub async fn run_once(&self) -> Result<usize> {
        let files = self
            .registry
            .files_with_status(&[ProcessingStatus::Extracted, ProcessingStatus::Incomplete])
            .await?;

        let mut handled = 0;
        for file in files {
            // Re-check before claiming: the listing is a snapshot and the
            // row may have moved on since
            let Some(current) = self.registry.get(&file.file_name).await? else {
                continue;
            };
            match current.processing_status {
                ProcessingStatus::Extracted | ProcessingStatus::Incomplete => {}
                _ => continue,
            }

            if let Err(e) = self.process_file(current).await {
                error!("Indexing pass for {} failed: {e:#}", file.file_name);
            }
            handled += 1;
        }
        Ok(handled)
    }

    async fn process_file(&self, mut record: FileRecord) -> Result<()> {
        info!(
            "Processing file: {} STATUS={}",
            record.file_name_orig, record.processing_status
        );
        let t_file = Instant::now();

        record.processing_status = ProcessingStatus::Processing;
        self.registry.update(&record.file_name, &record).await?;

        let jsonl = paragraph_file_path(&self.files_dir, &record.file_name);
        let paragraphs = match read_paragraphs(&jsonl).await {
            Ok(paragraphs) => paragraphs,
            Err(e) => {
                // The artifact is produced exactly once by extraction, so a
                // missing or unreadable file cannot heal by retrying
                let message = if jsonl.is_file() {
                    format!("Error: failed to read paragraph file: {e:#}")
                } else {
                    "Error: jsonl file not found on disk".to_string()
                };
                error!("{message}");
                record.processing_status = ProcessingStatus::failed(message.clone());
                self.registry.update(&record.file_name, &record).await?;
                self.tele.write(
                    &TelemetryEvent::for_file("load_paragraphs", EventStatus::Failure, &record)
                        .with_error(message, false),
                );
                return Ok(());
            }
        };

        let t_pass = Instant::now();
        let pass = self.index_paragraphs(&mut record, paragraphs).await;

        match &pass {
            Err(e) => {
                let message = format!("Error processing paragraphs: {e:#}");
                error!("{message}");
                record.processing_status = ProcessingStatus::Incomplete;
                self.tele.write(
                    &TelemetryEvent::for_file(
                        "process_file_paragraphs",
                        EventStatus::Failure,
                        &record,
                    )
                    .with_error(message, true)
                    .with_duration(t_pass.elapsed()),
                );
            }
            Ok(stats) => {
                record.processing_status = if stats.fully_indexed() {
                    ProcessingStatus::Complete
                } else {
                    ProcessingStatus::Incomplete
                };
                let status = if stats.fully_indexed() {
                    EventStatus::Success
                } else {
                    EventStatus::Failure
                };
                let mut event =
                    TelemetryEvent::for_file("process_file_paragraphs", status, &record)
                        .with_attributes(stats.as_attributes())
                        .with_duration(t_pass.elapsed());
                if !stats.fully_indexed() {
                    event = event.with_error(
                        format!("{} embedding batches failed", stats.batches_failed),
                        true,
                    );
                }
                self.tele.write(&event);
            }
        }

        self.registry.update(&record.file_name, &record).await?;

        let mut attributes = pass
            .as_ref()
            .map(|stats| stats.as_attributes())
            .unwrap_or_else(|_| serde_json::json!({}));
        attributes["processing_status"] =
            serde_json::Value::String(record.processing_status.as_str().to_string());
        self.tele.write(
            &TelemetryEvent::for_file("process_file_done", EventStatus::Info, &record)
                .with_attributes(attributes)
                .with_duration(t_file.elapsed()),
        );

        info!("{}; File {}", record.processing_status, record.file_name);
        Ok(())
    }

    /// Dedup, chunk, embed and write one file's paragraphs.
    ///
    /// `Err` means an infrastructure failure (dedup lookup, collection
    /// creation, vector write), all recoverable: the caller marks the file
    /// incomplete. Partial embedding failures are not errors: successes are
    /// written and the stats say the pass was not full.
    async fn index_paragraphs(
        &self,
        record: &mut FileRecord,
        mut paragraphs: Vec<ParagraphRecord>,
    ) -> Result<PassStats> {
        for paragraph in &mut paragraphs {
            paragraph.ensure_id();
        }

        let existing = self
            .sink
            .existing_paragraph_ids(record)
            .await
            .context("Fetching existing paragraph ids from sink")?;

        let mut stats = PassStats {
            paragraphs_total: paragraphs.len(),
            ..Default::default()
        };

        let todo: Vec<&ParagraphRecord> = paragraphs
            .iter()
            .filter(|p| {
                p.paragraph_id
                    .as_deref()
                    .is_none_or(|id| !existing.contains(id))
            })
            .collect();
        stats.paragraphs_skipped = paragraphs.len() - todo.len();

        if todo.is_empty() {
            return Ok(stats);
        }

        let mut chunks = Vec::new();
        for paragraph in &todo {
            let Some(id) = paragraph.paragraph_id.clone() else {
                continue;
            };
            let pieces = chunk_text(
                &paragraph.paragraph_text,
                self.estimator.as_ref(),
                self.config.chunk_target_tokens,
                self.config.chunk_max_tokens,
            );
            for (idx, text) in pieces.into_iter().enumerate() {
                chunks.push(ParagraphVector {
                    paragraph_id: id.clone(),
                    chunk_idx: idx as u32,
                    text,
                    page_n: paragraph.page_n,
                    paragraph_box: paragraph.paragraph_box,
                    embedding: None,
                });
            }
        }
        stats.chunks_total = chunks.len();

        let embedded = self.embed_chunks(chunks, &mut stats).await;

        if !embedded.is_empty() {
            let dimension = embedded[0]
                .embedding
                .as_ref()
                .map(|e| e.len())
                .unwrap_or(0);
            let collection = self
                .sink
                .ensure_collection(record, dimension)
                .await
                .context("Ensuring sink collection")?;
            if record.vector_store_id != collection {
                record.vector_store_id = collection;
                self.registry.update(&record.file_name, record).await?;
            }

            self.sink
                .write_vectors(record, &embedded)
                .await
                .context("Writing vectors to sink")?;
            stats.chunks_written = embedded.len();
        }

        Ok(stats)
    }

    /// Embed chunks in fixed-size batches under the concurrency semaphore.
    ///
    /// Every batch gets its own hard timeout; a timed-out or failed batch
    /// loses only its own chunks and never cancels siblings already
    /// scheduled. Returns the chunks that received an embedding, in input
    /// order.
    async fn embed_chunks(
        &self,
        chunks: Vec<ParagraphVector>,
        stats: &mut PassStats,
    ) -> Vec<ParagraphVector> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let timeout = self.config.embed_timeout;
        let batch_size = self.config.batch_size.max(1);

        let batches: Vec<Vec<ParagraphVector>> = chunks
            .chunks(batch_size)
            .map(|batch| batch.to_vec())
            .collect();
        stats.batches_total = batches.len();

        let futures = batches.into_iter().map(|mut batch| {
            let provider = Arc::clone(&self.provider);
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Err((batch.len(), "semaphore closed".to_string())),
                };

                let texts: Vec<String> = batch.iter().map(|chunk| chunk.text.clone()).collect();
                let result = match tokio::time::timeout(timeout, provider.embed_texts(&texts)).await
                {
                    Err(_) => {
                        return Err((
                            batch.len(),
                            format!(
                                "Timeout fetching embeddings (exceeded {}s)",
                                timeout.as_secs()
                            ),
                        ));
                    }
                    Ok(Err(e)) => return Err((batch.len(), format!("Error fetching embeddings: {e}"))),
                    Ok(Ok(result)) => result,
                };

                if result.len() != batch.len() {
                    return Err((
                        batch.len(),
                        format!(
                            "Unexpected number of embeddings: {} != {}",
                            result.len(),
                            batch.len()
                        ),
                    ));
                }

                for (chunk, embedding) in batch.iter_mut().zip(result.embeddings) {
                    chunk.embedding = Some(embedding);
                }
                Ok(batch)
            }
        });

        let mut embedded = Vec::new();
        for result in futures::future::join_all(futures).await {
            match result {
                Ok(batch) => {
                    stats.chunks_embedded += batch.len();
                    embedded.extend(batch);
                }
                Err((lost_chunks, message)) => {
                    warn!("Embedding batch failed ({lost_chunks} chunks): {message}");
                    stats.batches_failed += 1;
                    stats.chunks_failed += lost_chunks;
                }
            }
        }
        embedded
    }

    /// Recovery sweep, then the poll loop until the stop signal fires.
    pub fn spawn(self) -> WorkerHandle {
        let (stop_tx, mut stop) = WorkerHandle::stop_channel();
        let poll_interval = self.config.poll_interval;

        let handle = tokio::spawn(async move {
            match self.registry.reset_stuck().await {
                Ok(0) => {}
                Ok(n) => info!("Recovery sweep reset {n} files stuck in processing"),
                Err(e) => error!("Recovery sweep failed: {e:#}"),
            }

            loop {
                if let Err(e) = self.run_once().await {
                    error!("Indexing pass failed: {e:#}");
                }
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        });

        WorkerHandle::new("worker_indexer", stop_tx, handle)
    }
}
