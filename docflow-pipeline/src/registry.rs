//! Durable file registry: the source of truth for pipeline state.
//!
//! One row per stored document in the `user_files` table. The
//! `processing_status` column drives the per-file state machine; workers
//! claim rows by status, never by locking. All operations are individually
//! atomic but there are no cross-call transactions: callers re-check a
//! row's status before transitioning it.
//!
//! ## Schema
//!
//! ```sql
//! CREATE TABLE user_files (
//!     file_name TEXT PRIMARY KEY,      -- opaque storage key
//!     file_name_orig TEXT NOT NULL,    -- user-facing name
//!     user_id INTEGER NOT NULL,
//!     created_at TEXT NOT NULL,        -- ISO-8601
//!     processing_status TEXT NOT NULL DEFAULT '',
//!     vector_store_id TEXT NOT NULL DEFAULT ''
//! );
//! ```

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::fmt;
use std::path::Path;

/// Per-file processing state.
///
/// Stored as the legacy status strings (`""`, `extracted`, `processing`,
/// `incomplete`, `complete`, `Error: ...`) so the column stays readable by
/// the listing API, but represented as a closed enum in code: every
/// transition site matches exhaustively instead of comparing strings.
///
/// `Failed` carries the full error message and is terminal for the
/// pipeline; only external intervention (re-upload, manual reset) makes the
/// file eligible again. `Incomplete` is re-entrant and re-claimed on the
/// next indexing pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingStatus {
    /// Registered, nothing done yet
    New,
    /// Paragraph artifact written, awaiting indexing
    Extracted,
    /// Claimed by the indexing worker
    Processing,
    /// A pass ended with work left over; eligible for re-claim
    Incomplete,
    /// Every paragraph is in the sink
    Complete,
    /// Terminal error, message starts with `Error:`
    Failed(String),
}

impl ProcessingStatus {
    /// Build a `Failed` status, prefixing the conventional `Error:` marker
    /// when the message does not carry one already.
    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.starts_with("Error") {
            Self::Failed(message)
        } else {
            Self::Failed(format!("Error: {message}"))
        }
    }

    /// The stored column value.
    pub fn as_str(&self) -> &str {
        match self {
            Self::New => "",
            Self::Extracted => "extracted",
            Self::Processing => "processing",
            Self::Incomplete => "incomplete",
            Self::Complete => "complete",
            Self::Failed(message) => message,
        }
    }

    /// Parse a stored column value. Unknown strings are error messages by
    /// convention, so anything unrecognized becomes `Failed`.
    pub fn parse(value: &str) -> Self {
        match value {
            "" => Self::New,
            "extracted" => Self::Extracted,
            "processing" => Self::Processing,
            "incomplete" => Self::Incomplete,
            "complete" => Self::Complete,
            other => Self::Failed(other.to_string()),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "(new)"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// One registered document.
#[derive(Debug, Clone)]
pub struct FileRecord {
    /// Opaque storage key, primary key in the registry
    pub file_name: String,
    /// Original filename provided by the user
    pub file_name_orig: String,
    /// Owner of the file
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
    pub processing_status: ProcessingStatus,
    /// Backend-specific collection/index id; empty until first created
    pub vector_store_id: String,
}

impl FileRecord {
    /// A freshly registered record in status `New`.
    pub fn new(
        file_name: impl Into<String>,
        file_name_orig: impl Into<String>,
        user_id: i64,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            file_name_orig: file_name_orig.into(),
            user_id,
            created_at: Utc::now(),
            processing_status: ProcessingStatus::New,
            vector_store_id: String::new(),
        }
    }
}

/// SQLite-backed registry of file records.
///
/// Opened in WAL mode with a busy timeout, the same connection profile the
/// rest of the pipeline's durable state uses. Cheap to clone; clones share
/// the pool.
#[derive(Clone, Debug)]
pub struct FileRegistry {
    pool: SqlitePool,
}

impl FileRegistry {
    /// Open (or create) the registry database at `db_path`.
    pub async fn open(db_path: &Path) -> Result<Self> {
        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(db_path)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .busy_timeout(std::time::Duration::from_secs(5))
                .create_if_missing(true),
        )
        .await?;
        Self::new_with_pool(pool).await
    }

    /// In-memory registry for tests.
    ///
    /// Pinned to a single connection: every pooled connection to
    /// `sqlite::memory:` would otherwise see its own empty database.
    pub async fn open_memory() -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::new_with_pool(pool).await
    }

    async fn new_with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_files (
                file_name TEXT PRIMARY KEY,
                file_name_orig TEXT NOT NULL,
                user_id INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                processing_status TEXT NOT NULL DEFAULT '',
                vector_store_id TEXT NOT NULL DEFAULT ''
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_user_files_status ON user_files(processing_status)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Insert a new record. Returns `false` when the key already exists.
    pub async fn create(&self, record: &FileRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO user_files
            (file_name, file_name_orig, user_id, created_at, processing_status, vector_store_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&record.file_name)
        .bind(&record.file_name_orig)
        .bind(record.user_id)
        .bind(record.created_at.to_rfc3339())
        .bind(record.processing_status.as_str())
        .bind(&record.vector_store_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Update the record stored under `file_name`. Returns `false` when the
    /// row is missing.
    pub async fn update(&self, file_name: &str, record: &FileRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE user_files
            SET file_name_orig = ?1, user_id = ?2, created_at = ?3,
                processing_status = ?4, vector_store_id = ?5
            WHERE file_name = ?6
            "#,
        )
        .bind(&record.file_name_orig)
        .bind(record.user_id)
        .bind(record.created_at.to_rfc3339())
        .bind(record.processing_status.as_str())
        .bind(&record.vector_store_id)
        .bind(file_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Fetch a single record by key.
    pub async fn get(&self, file_name: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query(
            "SELECT file_name, file_name_orig, user_id, created_at, processing_status, vector_store_id
             FROM user_files WHERE file_name = ?1",
        )
        .bind(file_name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(record_from_row).transpose()
    }

    /// All records whose status matches one of `statuses`, newest first.
    pub async fn files_with_status(
        &self,
        statuses: &[ProcessingStatus],
    ) -> Result<Vec<FileRecord>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (1..=statuses.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!(
            "SELECT file_name, file_name_orig, user_id, created_at, processing_status, vector_store_id
             FROM user_files WHERE processing_status IN ({placeholders})
             ORDER BY created_at DESC"
        );

        let mut query_builder = sqlx::query(&query);
        for status in statuses {
            query_builder = query_builder.bind(status.as_str().to_string());
        }

        let rows = query_builder.fetch_all(&self.pool).await?;
        rows.into_iter().map(record_from_row).collect()
    }

    /// All records, newest first.
    pub async fn all_files(&self) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query(
            "SELECT file_name, file_name_orig, user_id, created_at, processing_status, vector_store_id
             FROM user_files ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(record_from_row).collect()
    }

    /// Delete a record. Returns `false` when the row was missing.
    pub async fn delete(&self, file_name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM user_files WHERE file_name = ?1")
            .bind(file_name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove rows whose file no longer exists on disk.
    ///
    /// `existing` is the list of file names currently present; an empty list
    /// clears the table.
    pub async fn cleanup_missing(&self, existing: &[String]) -> Result<usize> {
        let result = if existing.is_empty() {
            sqlx::query("DELETE FROM user_files").execute(&self.pool).await?
        } else {
            let placeholders = (1..=existing.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let query = format!("DELETE FROM user_files WHERE file_name NOT IN ({placeholders})");
            let mut query_builder = sqlx::query(&query);
            for name in existing {
                query_builder = query_builder.bind(name);
            }
            query_builder.execute(&self.pool).await?
        };
        Ok(result.rows_affected() as usize)
    }

    /// The recovery sweep: reset rows a crashed run left in `Processing`
    /// back to `Incomplete` so they are re-claimed. Run once at indexing
    /// worker startup, before any new claims.
    pub async fn reset_stuck(&self) -> Result<usize> {
        let result = sqlx::query(
            "UPDATE user_files SET processing_status = ?1 WHERE processing_status = ?2",
        )
        .bind(ProcessingStatus::Incomplete.as_str())
        .bind(ProcessingStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}

fn record_from_row(row: SqliteRow) -> Result<FileRecord> {
    let created_at: String = row.get("created_at");
    let processing_status: String = row.get("processing_status");

    Ok(FileRecord {
        file_name: row.get("file_name"),
        file_name_orig: row.get("file_name_orig"),
        user_id: row.get("user_id"),
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        processing_status: ProcessingStatus::parse(&processing_status),
        vector_store_id: row.get("vector_store_id"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        let statuses = [
            ProcessingStatus::New,
            ProcessingStatus::Extracted,
            ProcessingStatus::Processing,
            ProcessingStatus::Incomplete,
            ProcessingStatus::Complete,
            ProcessingStatus::failed("jsonl not found"),
        ];
        for status in statuses {
            assert_eq!(ProcessingStatus::parse(status.as_str()), status);
        }
        assert_eq!(
            ProcessingStatus::failed("boom").as_str(),
            "Error: boom"
        );
    }

    #[tokio::test]
    async fn test_create_is_false_on_duplicate_key() -> Result<()> {
        let registry = FileRegistry::open_memory().await?;
        let record = FileRecord::new("abc123.pdf", "report.pdf", 42);

        assert!(registry.create(&record).await?);
        assert!(!registry.create(&record).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_status_filter_and_update() -> Result<()> {
        let registry = FileRegistry::open_memory().await?;
        let mut record = FileRecord::new("abc123.pdf", "report.pdf", 42);
        registry.create(&record).await?;

        let new_files = registry
            .files_with_status(&[ProcessingStatus::New])
            .await?;
        assert_eq!(new_files.len(), 1);

        record.processing_status = ProcessingStatus::Extracted;
        assert!(registry.update(&record.file_name, &record).await?);

        assert!(registry
            .files_with_status(&[ProcessingStatus::New])
            .await?
            .is_empty());
        let extracted = registry
            .files_with_status(&[ProcessingStatus::Extracted, ProcessingStatus::Incomplete])
            .await?;
        assert_eq!(extracted.len(), 1);
        assert_eq!(
            extracted[0].processing_status,
            ProcessingStatus::Extracted
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_reset_stuck_only_touches_processing() -> Result<()> {
        let registry = FileRegistry::open_memory().await?;

        let mut stuck = FileRecord::new("stuck.pdf", "stuck.pdf", 1);
        stuck.processing_status = ProcessingStatus::Processing;
        registry.create(&stuck).await?;

        let mut done = FileRecord::new("done.pdf", "done.pdf", 1);
        done.processing_status = ProcessingStatus::Complete;
        registry.create(&done).await?;

        assert_eq!(registry.reset_stuck().await?, 1);

        let reloaded = registry.get("stuck.pdf").await?.unwrap();
        assert_eq!(reloaded.processing_status, ProcessingStatus::Incomplete);
        let untouched = registry.get("done.pdf").await?.unwrap();
        assert_eq!(untouched.processing_status, ProcessingStatus::Complete);
        Ok(())
    }

    #[tokio::test]
    async fn test_cleanup_missing() -> Result<()> {
        let registry = FileRegistry::open_memory().await?;
        registry
            .create(&FileRecord::new("keep.pdf", "keep.pdf", 1))
            .await?;
        registry
            .create(&FileRecord::new("gone.pdf", "gone.pdf", 1))
            .await?;

        let removed = registry
            .cleanup_missing(&["keep.pdf".to_string()])
            .await?;
        assert_eq!(removed, 1);
        assert!(registry.get("gone.pdf").await?.is_none());
        assert!(registry.get("keep.pdf").await?.is_some());
        Ok(())
    }
}
