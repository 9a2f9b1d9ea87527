//! Extraction worker.
//!
//! Polls the registry for freshly registered files, runs the extraction
//! collaborator over their bytes and persists the paragraph artifact.
//! Files are handled sequentially; extraction is not the concurrency-heavy
//! part of the pipeline.

use super::WorkerHandle;
use crate::extract::ParagraphExtractor;
use crate::paragraph::{paragraph_file_path, write_paragraphs};
use crate::registry::{FileRecord, FileRegistry, ProcessingStatus};
use crate::telemetry::{EventStatus, TeleWriter, TelemetryEvent};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

pub struct ExtractionWorker {
    registry: FileRegistry,
    extractor: Arc<dyn ParagraphExtractor>,
    files_dir: PathBuf,
    tele: TeleWriter,
    poll_interval: Duration,
}

impl ExtractionWorker {
    pub fn new(
        registry: FileRegistry,
        extractor: Arc<dyn ParagraphExtractor>,
        files_dir: PathBuf,
        tele: TeleWriter,
        poll_interval: Duration,
    ) -> Self {
        Self {
            registry,
            extractor,
            files_dir,
            tele,
            poll_interval,
        }
    }

    /// One polling pass: extract every file currently in `New`.
    ///
    /// Returns the number of files handled. Per-file failures land in the
    /// file's status, not in the returned result.
    pub async fn run_once(&self) -> Result<usize> {
        let files = self
            .registry
            .files_with_status(&[ProcessingStatus::New])
            .await?;

        let mut handled = 0;
        for file in files {
            // Re-check: the row may have changed since the listing
            let Some(current) = self.registry.get(&file.file_name).await? else {
                continue;
            };
            if current.processing_status != ProcessingStatus::New {
                continue;
            }

            self.extract_file(current).await;
            handled += 1;
        }
        Ok(handled)
    }

    async fn extract_file(&self, mut record: FileRecord) {
        info!("Extracting file: {}", record.file_name_orig);
        let t0 = Instant::now();
        let path = self.files_dir.join(&record.file_name);

        let outcome = async {
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|_| format!("file is missing on disk: {}", path.display()))?;

            let paragraphs = self
                .extractor
                .extract(&bytes, &record.file_name_orig)
                .await
                .map_err(|e| format!("{e:#}"))?;
            if paragraphs.is_empty() {
                return Err(format!("no paragraphs extracted from file: {}", path.display()));
            }
            Ok(paragraphs)
        }
        .await;

        match outcome {
            Err(message) => {
                let message = format!("Error extracting file: {message}");
                error!("{message}");
                record.processing_status = ProcessingStatus::failed(message.clone());
                self.persist(&record).await;
                self.tele.write(
                    &TelemetryEvent::for_file("extract_file", EventStatus::Failure, &record)
                        .with_error(message, false)
                        .with_duration(t0.elapsed()),
                );
            }
            Ok(mut paragraphs) => {
                for paragraph in &mut paragraphs {
                    paragraph.ensure_id();
                }

                let jsonl = paragraph_file_path(&self.files_dir, &record.file_name);
                if let Err(e) = write_paragraphs(&jsonl, &paragraphs).await {
                    let message = format!("Error extracting file: {e:#}");
                    error!("{message}");
                    record.processing_status = ProcessingStatus::failed(message.clone());
                    self.persist(&record).await;
                    self.tele.write(
                        &TelemetryEvent::for_file("extract_file", EventStatus::Failure, &record)
                            .with_error(message, false)
                            .with_duration(t0.elapsed()),
                    );
                    return;
                }

                record.processing_status = ProcessingStatus::Extracted;
                self.persist(&record).await;
                self.tele.write(
                    &TelemetryEvent::for_file("extract_file", EventStatus::Success, &record)
                        .with_attributes(serde_json::json!({
                            "paragraphs": paragraphs.len(),
                        }))
                        .with_duration(t0.elapsed()),
                );
                info!("Extracting file {} OK", record.file_name_orig);
            }
        }
    }

    async fn persist(&self, record: &FileRecord) {
        match self.registry.update(&record.file_name, record).await {
            Ok(true) => {}
            Ok(false) => error!("File {} vanished during extraction", record.file_name),
            Err(e) => error!("Failed to update {}: {e:#}", record.file_name),
        }
    }

    /// Run the poll loop until the stop signal fires.
    pub fn spawn(self) -> WorkerHandle {
        let (stop_tx, mut stop) = WorkerHandle::stop_channel();
        let poll_interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            loop {
                if let Err(e) = self.run_once().await {
                    // Registry trouble; back off and retry next tick
                    error!("Extraction pass failed: {e:#}");
                }
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        });

        WorkerHandle::new("worker_extractor", stop_tx, handle)
    }
}
