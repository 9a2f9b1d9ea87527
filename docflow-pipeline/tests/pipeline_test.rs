//! End-to-end pipeline tests over the embedded sink and a scripted
//! embedding provider: idempotent indexing, crash recovery, partial batch
//! failure isolation and the extraction → indexing handoff.

use async_trait::async_trait;
use docflow_embed::{EmbedError, EmbeddingProvider, EmbeddingResult};
use docflow_pipeline::chunker::CharsPerToken;
use docflow_pipeline::extract::PlainTextExtractor;
use docflow_pipeline::paragraph::{paragraph_file_path, write_paragraphs, ParagraphRecord};
use docflow_pipeline::registry::{FileRecord, FileRegistry, ProcessingStatus};
use docflow_pipeline::sink::{EmbeddedVectorStore, SearchQuery, VectorSink};
use docflow_pipeline::telemetry::{TeleWriter, TelemetryScope};
use docflow_pipeline::workers::{ExtractionWorker, IndexingConfig, IndexingWorker};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Scripted embedding provider: counts calls, can fail or stall batches
/// whose text matches a pattern.
#[derive(Default)]
struct ScriptedProvider {
    calls: AtomicUsize,
    fail_matching: Mutex<Option<String>>,
    stall_matching: Mutex<Option<String>>,
}

impl ScriptedProvider {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail_batches_containing(&self, pattern: &str) {
        *self.fail_matching.lock().unwrap() = Some(pattern.to_string());
    }

    fn stall_batches_containing(&self, pattern: &str) {
        *self.stall_matching.lock().unwrap() = Some(pattern.to_string());
    }

    fn heal(&self) {
        *self.fail_matching.lock().unwrap() = None;
        *self.stall_matching.lock().unwrap() = None;
    }
}

#[async_trait]
impl EmbeddingProvider for ScriptedProvider {
    async fn embed_texts(&self, texts: &[String]) -> docflow_embed::Result<EmbeddingResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let stall = self.stall_matching.lock().unwrap().clone();
        if let Some(pattern) = stall {
            if texts.iter().any(|t| t.contains(&pattern)) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
        }

        let fail = self.fail_matching.lock().unwrap().clone();
        if let Some(pattern) = fail {
            if texts.iter().any(|t| t.contains(&pattern)) {
                return Err(EmbedError::Api {
                    status: 500,
                    message: "scripted failure".to_string(),
                });
            }
        }

        // Deterministic dummy vectors, one per input
        let embeddings = texts
            .iter()
            .map(|t| vec![t.len() as f32, 1.0, 0.0])
            .collect();
        Ok(EmbeddingResult::new(embeddings))
    }

    fn dimension_hint(&self) -> Option<usize> {
        Some(3)
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }
}

struct Harness {
    dir: TempDir,
    registry: FileRegistry,
    sink: Arc<EmbeddedVectorStore>,
    provider: Arc<ScriptedProvider>,
}

impl Harness {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        Self {
            registry: FileRegistry::open_memory().await.unwrap(),
            sink: Arc::new(EmbeddedVectorStore::open_memory().await.unwrap()),
            provider: Arc::new(ScriptedProvider::default()),
            dir,
        }
    }

    fn indexer(&self, config: IndexingConfig) -> IndexingWorker {
        IndexingWorker::new(
            self.registry.clone(),
            self.sink.clone(),
            self.provider.clone(),
            Arc::new(CharsPerToken::default()),
            self.dir.path().to_path_buf(),
            TeleWriter::new(self.dir.path().join("telemetry"), TelemetryScope::Indexer),
            config,
        )
    }

    /// Register a file in `Extracted` with a three-paragraph artifact.
    async fn seed_three_paragraphs(&self, file_name: &str) -> FileRecord {
        let mut record = FileRecord::new(file_name, file_name, 1);
        record.processing_status = ProcessingStatus::Extracted;
        assert!(self.registry.create(&record).await.unwrap());

        let mut paragraphs: Vec<ParagraphRecord> = [
            "paragraph one of the document",
            "paragraph two of the document",
            "paragraph three of the document",
        ]
        .iter()
        .enumerate()
        .map(|(i, text)| ParagraphRecord {
            page_n: i as u32 + 1,
            section_number: None,
            paragraph_text: text.to_string(),
            paragraph_box: [0.0, 0.0, 10.0, 10.0],
            paragraph_id: None,
        })
        .collect();
        for paragraph in &mut paragraphs {
            paragraph.ensure_id();
        }

        write_paragraphs(
            &paragraph_file_path(self.dir.path(), file_name),
            &paragraphs,
        )
        .await
        .unwrap();
        record
    }

    async fn status_of(&self, file_name: &str) -> ProcessingStatus {
        self.registry
            .get(file_name)
            .await
            .unwrap()
            .unwrap()
            .processing_status
    }

    /// Every row the sink holds for the file.
    async fn sink_rows(&self, file_name: &str) -> usize {
        let record = self.registry.get(file_name).await.unwrap().unwrap();
        self.sink
            .search(
                &record,
                &SearchQuery {
                    text: String::new(),
                    vector: Some(vec![1.0, 0.0, 0.0]),
                },
                1000,
            )
            .await
            .unwrap()
            .len()
    }

    /// Force the file back into the claimable set, as an operator would.
    async fn reopen(&self, file_name: &str) {
        let mut record = self.registry.get(file_name).await.unwrap().unwrap();
        record.processing_status = ProcessingStatus::Incomplete;
        self.registry.update(file_name, &record).await.unwrap();
    }
}

#[tokio::test]
async fn test_clean_pass_reaches_complete_then_second_pass_is_a_no_op() {
    let harness = Harness::new().await;
    harness.seed_three_paragraphs("doc1.pdf").await;

    // Batch size covers all three paragraphs, concurrency 2
    let indexer = harness.indexer(
        IndexingConfig::default()
            .with_batch_size(16)
            .with_concurrency(2),
    );

    assert_eq!(indexer.run_once().await.unwrap(), 1);
    assert_eq!(
        harness.status_of("doc1.pdf").await,
        ProcessingStatus::Complete
    );
    assert_eq!(harness.sink_rows("doc1.pdf").await, 3);
    assert_eq!(harness.provider.calls(), 1);

    // Completed files are not re-claimed
    assert_eq!(indexer.run_once().await.unwrap(), 0);

    // A manually triggered pass sees every id in the sink and issues zero
    // embedding calls
    harness.reopen("doc1.pdf").await;
    assert_eq!(indexer.run_once().await.unwrap(), 1);
    assert_eq!(
        harness.status_of("doc1.pdf").await,
        ProcessingStatus::Complete
    );
    assert_eq!(harness.sink_rows("doc1.pdf").await, 3);
    assert_eq!(harness.provider.calls(), 1);
}

#[tokio::test]
async fn test_partial_failure_keeps_successes_and_retries_only_the_remainder() {
    let harness = Harness::new().await;
    harness.seed_three_paragraphs("doc1.pdf").await;

    // One paragraph per batch so a failure is isolated
    let indexer = harness.indexer(
        IndexingConfig::default()
            .with_batch_size(1)
            .with_concurrency(2),
    );

    harness
        .provider
        .fail_batches_containing("paragraph two");
    indexer.run_once().await.unwrap();

    assert_eq!(
        harness.status_of("doc1.pdf").await,
        ProcessingStatus::Incomplete
    );
    assert_eq!(harness.sink_rows("doc1.pdf").await, 2);
    assert_eq!(harness.provider.calls(), 3);

    // Next pass only embeds the failed remainder
    harness.provider.heal();
    indexer.run_once().await.unwrap();

    assert_eq!(
        harness.status_of("doc1.pdf").await,
        ProcessingStatus::Complete
    );
    assert_eq!(harness.sink_rows("doc1.pdf").await, 3);
    assert_eq!(harness.provider.calls(), 4);
}

#[tokio::test]
async fn test_batch_timeout_aborts_only_that_batch() {
    let harness = Harness::new().await;
    harness.seed_three_paragraphs("doc1.pdf").await;

    let indexer = harness.indexer(
        IndexingConfig::default()
            .with_batch_size(1)
            .with_concurrency(3)
            .with_embed_timeout(Duration::from_millis(200)),
    );

    harness
        .provider
        .stall_batches_containing("paragraph two");
    indexer.run_once().await.unwrap();

    // Siblings of the timed-out batch still landed
    assert_eq!(
        harness.status_of("doc1.pdf").await,
        ProcessingStatus::Incomplete
    );
    assert_eq!(harness.sink_rows("doc1.pdf").await, 2);

    harness.provider.heal();
    indexer.run_once().await.unwrap();
    assert_eq!(
        harness.status_of("doc1.pdf").await,
        ProcessingStatus::Complete
    );
    assert_eq!(harness.sink_rows("doc1.pdf").await, 3);
}

#[tokio::test]
async fn test_recovery_sweep_converges_without_re_embedding() {
    let harness = Harness::new().await;
    harness.seed_three_paragraphs("doc1.pdf").await;

    let indexer = harness.indexer(IndexingConfig::default().with_batch_size(16));
    indexer.run_once().await.unwrap();
    assert_eq!(harness.provider.calls(), 1);

    // Simulate a crash mid-index: the row is left in `processing`
    let mut record = harness.registry.get("doc1.pdf").await.unwrap().unwrap();
    record.processing_status = ProcessingStatus::Processing;
    harness.registry.update("doc1.pdf", &record).await.unwrap();

    // Nothing is claimable while the row looks in-flight
    assert_eq!(indexer.run_once().await.unwrap(), 0);

    // The startup sweep makes it claimable again, and the pass converges
    // on the sink's existing vectors without new embedding calls
    assert_eq!(harness.registry.reset_stuck().await.unwrap(), 1);
    assert_eq!(
        harness.status_of("doc1.pdf").await,
        ProcessingStatus::Incomplete
    );
    indexer.run_once().await.unwrap();
    assert_eq!(
        harness.status_of("doc1.pdf").await,
        ProcessingStatus::Complete
    );
    assert_eq!(harness.sink_rows("doc1.pdf").await, 3);
    assert_eq!(harness.provider.calls(), 1);
}

#[tokio::test]
async fn test_missing_artifact_is_terminal() {
    let harness = Harness::new().await;
    let mut record = FileRecord::new("no-artifact.pdf", "no-artifact.pdf", 1);
    record.processing_status = ProcessingStatus::Extracted;
    harness.registry.create(&record).await.unwrap();

    let indexer = harness.indexer(IndexingConfig::default());
    indexer.run_once().await.unwrap();

    let status = harness.status_of("no-artifact.pdf").await;
    assert_eq!(
        status,
        ProcessingStatus::Failed("Error: jsonl file not found on disk".to_string())
    );
    assert_eq!(harness.provider.calls(), 0);

    // Terminal errors are not re-claimed
    assert_eq!(indexer.run_once().await.unwrap(), 0);
}

#[tokio::test]
async fn test_oversized_paragraph_is_chunked_and_still_dedups() {
    let harness = Harness::new().await;

    let mut record = FileRecord::new("big.pdf", "big.pdf", 1);
    record.processing_status = ProcessingStatus::Extracted;
    harness.registry.create(&record).await.unwrap();

    let mut paragraph = ParagraphRecord {
        page_n: 1,
        section_number: None,
        paragraph_text: "a line of filler text for the big paragraph\n".repeat(50),
        paragraph_box: [0.0, 0.0, 10.0, 10.0],
        paragraph_id: None,
    };
    paragraph.ensure_id();
    write_paragraphs(
        &paragraph_file_path(harness.dir.path(), "big.pdf"),
        std::slice::from_ref(&paragraph),
    )
    .await
    .unwrap();

    let indexer = harness.indexer(
        IndexingConfig::default()
            .with_batch_size(16)
            .with_chunk_tokens(32, 64),
    );
    indexer.run_once().await.unwrap();

    assert_eq!(
        harness.status_of("big.pdf").await,
        ProcessingStatus::Complete
    );
    // One paragraph id, several chunk rows
    let ids = harness.sink.existing_paragraph_ids(&record).await.unwrap();
    assert_eq!(ids.len(), 1);
    assert!(harness.sink_rows("big.pdf").await > 1);
    let calls_after_first = harness.provider.calls();

    // Re-running skips the whole paragraph: dedup is paragraph-granular
    harness.reopen("big.pdf").await;
    indexer.run_once().await.unwrap();
    assert_eq!(
        harness.status_of("big.pdf").await,
        ProcessingStatus::Complete
    );
    assert_eq!(harness.provider.calls(), calls_after_first);
}

#[tokio::test]
async fn test_extraction_to_indexing_handoff() {
    let harness = Harness::new().await;

    tokio::fs::write(
        harness.dir.path().join("doc.txt"),
        b"first paragraph\n\nsecond paragraph",
    )
    .await
    .unwrap();
    harness
        .registry
        .create(&FileRecord::new("doc.txt", "doc.txt", 9))
        .await
        .unwrap();

    let extraction = ExtractionWorker::new(
        harness.registry.clone(),
        Arc::new(PlainTextExtractor),
        harness.dir.path().to_path_buf(),
        TeleWriter::new(
            harness.dir.path().join("telemetry"),
            TelemetryScope::Extractor,
        ),
        Duration::from_secs(1),
    );
    assert_eq!(extraction.run_once().await.unwrap(), 1);
    assert_eq!(
        harness.status_of("doc.txt").await,
        ProcessingStatus::Extracted
    );

    let indexer = harness.indexer(IndexingConfig::default());
    indexer.run_once().await.unwrap();

    assert_eq!(
        harness.status_of("doc.txt").await,
        ProcessingStatus::Complete
    );
    assert_eq!(harness.sink_rows("doc.txt").await, 2);

    // The collection id assigned by the sink is persisted on the record
    let record = harness.registry.get("doc.txt").await.unwrap().unwrap();
    assert_eq!(record.vector_store_id, "doc");
}
