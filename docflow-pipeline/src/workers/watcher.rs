//! Directory ingestion watcher.
//!
//! Keeps the file registry in sync with the watched directory: on startup a
//! full reconcile (register new files, drop rows for files gone from disk),
//! then incremental debounced filesystem events applying the same two
//! rules. Files carry their required metadata (`user_id`,
//! `file_name_orig`) in a `<file>.meta.json` sidecar; a file without a
//! valid sidecar is skipped with a warning.
//!
//! Known gap: a file still being written when its create event fires may
//! be read before it is complete. The extractor fails or finds no
//! paragraphs in that case, which the extraction worker treats as a normal
//! error.

use super::WorkerHandle;
use crate::registry::{FileRecord, FileRegistry};
use anyhow::{Context, Result};
use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Required sidecar metadata for an ingested file.
#[derive(Debug, Deserialize)]
struct FileMeta {
    user_id: i64,
    file_name_orig: String,
}

/// Watches one directory (non-recursive) and synchronizes it into the
/// registry.
#[derive(Clone)]
pub struct IngestWatcher {
    registry: FileRegistry,
    files_dir: PathBuf,
    extensions: Vec<String>,
}

impl IngestWatcher {
    pub fn new(registry: FileRegistry, files_dir: PathBuf, extensions: Vec<String>) -> Self {
        Self {
            registry,
            files_dir,
            extensions: extensions.into_iter().map(|e| e.to_lowercase()).collect(),
        }
    }

    fn matches_rule(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_lowercase();
                self.extensions.iter().any(|e| *e == ext)
            })
            .unwrap_or(false)
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut name = OsString::from(path.as_os_str());
        name.push(".meta.json");
        PathBuf::from(name)
    }

    async fn read_sidecar(path: &Path) -> Result<FileMeta> {
        let sidecar = Self::sidecar_path(path);
        let content = tokio::fs::read_to_string(&sidecar)
            .await
            .with_context(|| format!("Missing metadata sidecar {}", sidecar.display()))?;
        let meta: FileMeta = serde_json::from_str(&content)
            .with_context(|| format!("Malformed metadata sidecar {}", sidecar.display()))?;
        Ok(meta)
    }

    /// Register a file if it is not in the registry yet and carries valid
    /// sidecar metadata.
    pub async fn register_file(&self, path: &Path) -> Result<()> {
        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return Ok(());
        };

        if self.registry.get(&file_name).await?.is_some() {
            info!("File {file_name} already registered, skipping");
            return Ok(());
        }

        let meta = match Self::read_sidecar(path).await {
            Ok(meta) => meta,
            Err(e) => {
                warn!("Skipping {file_name}: {e:#}");
                return Ok(());
            }
        };
        if meta.file_name_orig.is_empty() {
            warn!("Skipping {file_name}: sidecar has empty file_name_orig");
            return Ok(());
        }

        let record = FileRecord::new(file_name.clone(), meta.file_name_orig, meta.user_id);
        if self.registry.create(&record).await? {
            info!("Registered file {file_name} for user {}", record.user_id);
        } else {
            // Lost a race with another registration path; the row exists
            info!("File {file_name} already registered, skipping");
        }
        Ok(())
    }

    /// Startup pass: every matching file on disk gets registered, every row
    /// without a file on disk is removed.
    pub async fn reconcile(&self) -> Result<()> {
        let mut matching = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.files_dir)
            .await
            .with_context(|| format!("Cannot read watched dir {}", self.files_dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_file() && self.matches_rule(&path) {
                matching.push(path);
            }
        }

        let names: Vec<String> = matching
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        let removed = self.registry.cleanup_missing(&names).await?;
        if removed > 0 {
            info!("Removed {removed} registry rows for files no longer on disk");
        }

        for path in &matching {
            self.register_file(path).await?;
        }
        Ok(())
    }

    /// Apply one debounced filesystem event.
    ///
    /// The debouncer does not distinguish create from delete, so the event
    /// is resolved by probing the filesystem.
    pub async fn handle_event(&self, path: &Path) -> Result<()> {
        if !self.matches_rule(path) {
            return Ok(());
        }

        if path.is_file() {
            self.register_file(path).await?;
        } else if let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned())
        {
            if self.registry.delete(&file_name).await? {
                info!("Removed file {file_name} from registry after deletion from disk");
            }
        }
        Ok(())
    }

    /// Reconcile, then watch for changes until the stop signal fires.
    pub fn spawn(self, debounce: Duration) -> Result<WorkerHandle> {
        let (stop_tx, mut stop) = WorkerHandle::stop_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<PathBuf>();

        let mut debouncer = new_debouncer(
            debounce,
            move |result: notify_debouncer_mini::DebounceEventResult| match result {
                Ok(events) => {
                    for event in events {
                        let _ = event_tx.send(event.path);
                    }
                }
                Err(e) => error!("Watch error: {e}"),
            },
        )?;
        debouncer
            .watcher()
            .watch(&self.files_dir, RecursiveMode::NonRecursive)?;

        let handle = tokio::spawn(async move {
            // The debouncer must stay alive for the worker's lifetime
            let _debouncer = debouncer;

            if let Err(e) = self.reconcile().await {
                error!("Watcher reconcile failed: {e:#}");
            }

            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    event = event_rx.recv() => match event {
                        Some(path) => {
                            if let Err(e) = self.handle_event(&path).await {
                                error!("Failed to handle event for {}: {e:#}", path.display());
                            }
                        }
                        None => break,
                    }
                }
            }
        });

        Ok(WorkerHandle::new("worker_watcher", stop_tx, handle))
    }
}
