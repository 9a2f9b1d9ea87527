//! Append-only pipeline telemetry.
//!
//! Each worker scope gets a date-partitioned JSONL stream under the
//! telemetry directory (`<scope>/<YYYYMMDD>.jsonl`). The pipeline only ever
//! writes here; operators and offline tooling read it. A failed write is
//! logged and swallowed; observability must never take a worker loop down.

use crate::registry::FileRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;

/// Telemetry stream, one per pipeline scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryScope {
    Watcher,
    Extractor,
    Indexer,
}

impl TelemetryScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Watcher => "w_watcher",
            Self::Extractor => "w_extractor",
            Self::Indexer => "w_indexer",
        }
    }
}

/// Outcome class of a telemetry event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Info,
    Success,
    Failure,
}

/// One telemetry record.
///
/// Built with the `with_*` setters and handed to [`TeleWriter::write`].
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    pub version: &'static str,
    /// Stage name, e.g. `process_file_done`
    pub event: String,
    pub status: EventStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_recoverable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name_orig: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_store: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryEvent {
    pub fn new(event: impl Into<String>, status: EventStatus) -> Self {
        Self {
            version: "v0",
            event: event.into(),
            status,
            error_message: None,
            error_recoverable: None,
            user_id: None,
            file_name: None,
            file_name_orig: None,
            vector_store: None,
            attributes: None,
            duration_seconds: None,
            timestamp: Utc::now(),
        }
    }

    /// Event pre-filled with the identity fields of a file record.
    pub fn for_file(
        event: impl Into<String>,
        status: EventStatus,
        record: &FileRecord,
    ) -> Self {
        let mut this = Self::new(event, status);
        this.user_id = Some(record.user_id);
        this.file_name = Some(record.file_name.clone());
        this.file_name_orig = Some(record.file_name_orig.clone());
        if !record.vector_store_id.is_empty() {
            this.vector_store = Some(record.vector_store_id.clone());
        }
        this
    }

    pub fn with_error(mut self, message: impl Into<String>, recoverable: bool) -> Self {
        self.error_message = Some(message.into());
        self.error_recoverable = Some(recoverable);
        self
    }

    pub fn with_attributes(mut self, attributes: serde_json::Value) -> Self {
        self.attributes = Some(attributes);
        self
    }

    pub fn with_duration(mut self, duration: std::time::Duration) -> Self {
        self.duration_seconds = Some(duration.as_secs_f64());
        self
    }
}

/// Writer for one telemetry scope.
///
/// Cheap to clone; every write opens the day's file in append mode so
/// rotation is just the date changing.
#[derive(Debug, Clone)]
pub struct TeleWriter {
    scope_dir: PathBuf,
}

impl TeleWriter {
    pub fn new(base_dir: impl Into<PathBuf>, scope: TelemetryScope) -> Self {
        let scope_dir = base_dir.into().join(scope.as_str());
        if let Err(e) = std::fs::create_dir_all(&scope_dir) {
            tracing::warn!(
                "Failed to create telemetry dir {}: {}",
                scope_dir.display(),
                e
            );
        }
        Self { scope_dir }
    }

    /// Path of today's partition.
    pub fn current_file_path(&self) -> PathBuf {
        let today = Utc::now().format("%Y%m%d");
        self.scope_dir.join(format!("{today}.jsonl"))
    }

    /// Append one event. Failures are logged, never propagated.
    pub fn write(&self, event: &TelemetryEvent) {
        if let Err(e) = self.try_write(event) {
            tracing::warn!("Failed to write telemetry event {}: {}", event.event, e);
        }
    }

    fn try_write(&self, event: &TelemetryEvent) -> anyhow::Result<()> {
        let line = serde_json::to_string(event)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.current_file_path())?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_events_append_to_dated_partition() {
        let dir = tempdir().unwrap();
        let writer = TeleWriter::new(dir.path(), TelemetryScope::Indexer);

        let record = FileRecord::new("abc.pdf", "report.pdf", 7);
        writer.write(
            &TelemetryEvent::for_file("process_file_done", EventStatus::Info, &record)
                .with_attributes(serde_json::json!({"processing_status": "complete"}))
                .with_duration(std::time::Duration::from_millis(1500)),
        );
        writer.write(
            &TelemetryEvent::for_file("process_file_paragraphs", EventStatus::Failure, &record)
                .with_error("Timeout fetching embedding", true),
        );

        let path = writer.current_file_path();
        assert!(path.starts_with(dir.path().join("w_indexer")));

        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "process_file_done");
        assert_eq!(first["status"], "info");
        assert_eq!(first["user_id"], 7);
        assert_eq!(first["duration_seconds"], 1.5);

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["status"], "failure");
        assert_eq!(second["error_recoverable"], true);
    }
}
