//! Embedded SQLite vector store.
//!
//! One physical table per file, named deterministically from the storage
//! key, inside a single local database. Embeddings are stored as f32 BLOBs
//! and searched with brute-force cosine similarity in memory, fine at
//! per-file paragraph counts, and the whole point of this backend is zero
//! external moving parts.

use super::{collection_from_file_name, ScoredChunk, SearchQuery, VectorSink};
use crate::paragraph::ParagraphVector;
use crate::registry::FileRecord;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::path::Path;

/// Local SQLite-backed [`VectorSink`].
#[derive(Clone, Debug)]
pub struct EmbeddedVectorStore {
    pool: SqlitePool,
}

impl EmbeddedVectorStore {
    /// Open (or create) the vector database at `db_path`.
    pub async fn open(db_path: &Path) -> Result<Self> {
        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(db_path)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .busy_timeout(std::time::Duration::from_secs(5))
                .create_if_missing(true)
                // 64KB pages: rows are mostly embedding blobs
                .page_size(1 << 16),
        )
        .await?;
        Self::new_with_pool(pool).await
    }

    /// In-memory store for tests.
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
            CREATE TABLE IF NOT EXISTS collections (
                name TEXT PRIMARY KEY,
                dimension INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool> {
        let row = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        )
        .bind(format!("vec_{collection}"))
        .fetch_one(&self.pool)
        .await?;
        Ok(row > 0)
    }
}

fn vector_table(collection: &str) -> String {
    format!("vec_{collection}")
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    bytemuck::cast_slice::<f32, u8>(embedding).to_vec()
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    bytemuck::cast_slice::<u8, f32>(blob).to_vec()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[async_trait]
impl VectorSink for EmbeddedVectorStore {
    async fn existing_paragraph_ids(&self, file: &FileRecord) -> Result<HashSet<String>> {
        let collection = collection_from_file_name(&file.file_name);
        if !self.collection_exists(&collection).await? {
            return Ok(HashSet::new());
        }

        let table = vector_table(&collection);
        let ids = sqlx::query_scalar::<_, String>(&format!(
            r#"SELECT DISTINCT paragraph_id FROM "{table}""#
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }

    async fn ensure_collection(&self, file: &FileRecord, dimension: usize) -> Result<String> {
        let collection = collection_from_file_name(&file.file_name);
        let table = vector_table(&collection);

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{table}" (
                paragraph_id TEXT NOT NULL,
                chunk_idx INTEGER NOT NULL,
                text TEXT NOT NULL,
                page_n INTEGER NOT NULL,
                paragraph_box TEXT NOT NULL,
                embedding BLOB NOT NULL,
                PRIMARY KEY (paragraph_id, chunk_idx)
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO collections (name, dimension) VALUES (?1, ?2)")
            .bind(&collection)
            .bind(dimension as i64)
            .execute(&self.pool)
            .await?;

        tracing::debug!("Ensured collection {collection} (dimension {dimension})");
        Ok(collection)
    }

    async fn write_vectors(&self, file: &FileRecord, vectors: &[ParagraphVector]) -> Result<()> {
        let collection = collection_from_file_name(&file.file_name);
        let table = vector_table(&collection);
        let query = format!(
            r#"
            INSERT INTO "{table}" (paragraph_id, chunk_idx, text, page_n, paragraph_box, embedding)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(paragraph_id, chunk_idx) DO UPDATE SET
                text = excluded.text,
                page_n = excluded.page_n,
                paragraph_box = excluded.paragraph_box,
                embedding = excluded.embedding
            "#
        );

        let mut tx = self.pool.begin().await?;
        let mut written = 0usize;
        for vector in vectors {
            let embedding = vector
                .embedding
                .as_ref()
                .ok_or_else(|| anyhow!("Vector for {} has no embedding", vector.paragraph_id))?;

            sqlx::query(&query)
                .bind(&vector.paragraph_id)
                .bind(vector.chunk_idx as i64)
                .bind(&vector.text)
                .bind(vector.page_n as i64)
                .bind(serde_json::to_string(&vector.paragraph_box)?)
                .bind(embedding_to_blob(embedding))
                .execute(&mut *tx)
                .await?;
            written += 1;
        }
        tx.commit().await?;

        tracing::debug!("Wrote {written} vectors into collection {collection}");
        Ok(())
    }

    async fn search(
        &self,
        file: &FileRecord,
        query: &SearchQuery,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let vector = query
            .vector
            .as_ref()
            .ok_or_else(|| anyhow!("Embedded store searches require a query vector"))?;

        let collection = collection_from_file_name(&file.file_name);
        if !self.collection_exists(&collection).await? {
            return Ok(Vec::new());
        }

        let table = vector_table(&collection);
        let rows = sqlx::query(&format!(
            r#"SELECT paragraph_id, chunk_idx, text, page_n, embedding FROM "{table}""#
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<ScoredChunk> = rows
            .into_iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let chunk_idx: i64 = row.get("chunk_idx");
                let page_n: i64 = row.get("page_n");
                ScoredChunk {
                    paragraph_id: row.get("paragraph_id"),
                    chunk_idx: chunk_idx as u32,
                    text: row.get("text"),
                    score: cosine_similarity(vector, &blob_to_embedding(&blob)),
                    page_n: Some(page_n as u32),
                }
            })
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(limit);
        Ok(scored)
    }

    fn backend_name(&self) -> &'static str {
        "embedded"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(id: &str, idx: u32, embedding: Vec<f32>) -> ParagraphVector {
        ParagraphVector {
            paragraph_id: id.to_string(),
            chunk_idx: idx,
            text: format!("text of {id}/{idx}"),
            page_n: 1,
            paragraph_box: [0.0, 0.0, 1.0, 1.0],
            embedding: Some(embedding),
        }
    }

    #[tokio::test]
    async fn test_missing_collection_reports_empty_not_error() -> Result<()> {
        let store = EmbeddedVectorStore::open_memory().await?;
        let file = FileRecord::new("doc1.pdf", "doc1.pdf", 1);
        assert!(store.existing_paragraph_ids(&file).await?.is_empty());
        assert!(store
            .search(
                &file,
                &SearchQuery {
                    text: "q".into(),
                    vector: Some(vec![1.0, 0.0])
                },
                5
            )
            .await?
            .is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_write_twice_is_idempotent() -> Result<()> {
        let store = EmbeddedVectorStore::open_memory().await?;
        let file = FileRecord::new("doc1.pdf", "doc1.pdf", 1);

        store.ensure_collection(&file, 2).await?;
        // ensure_collection is idempotent too
        let collection = store.ensure_collection(&file, 2).await?;
        assert_eq!(collection, "doc1");

        let vectors = vec![
            vector("pid-a", 0, vec![1.0, 0.0]),
            vector("pid-b", 0, vec![0.0, 1.0]),
        ];
        store.write_vectors(&file, &vectors).await?;
        store.write_vectors(&file, &vectors).await?;

        let ids = store.existing_paragraph_ids(&file).await?;
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("pid-a"));

        // Exactly one row per (paragraph, chunk) despite the double write
        let results = store
            .search(
                &file,
                &SearchQuery {
                    text: "q".into(),
                    vector: Some(vec![1.0, 0.0]),
                },
                10,
            )
            .await?;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].paragraph_id, "pid-a");
        assert!(results[0].score > results[1].score);
        Ok(())
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }
}
