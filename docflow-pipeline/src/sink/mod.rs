//! Vector storage abstraction.
//!
//! A [`VectorSink`] is where paragraph vectors land once embedded, and the
//! only thing the indexing worker knows about storage. The worker is handed
//! one concrete sink at construction time; which one is a deployment
//! decision, never a runtime branch inside business logic.
//!
//! All backends share an at-least-once contract: `write_vectors` is an
//! upsert, and `existing_paragraph_ids` lets the worker recompute its dedup
//! set from the sink itself on every pass, so a crash between writing and
//! recording status converges instead of duplicating.
//!
//! ## Backends
//!
//! - [`embedded::EmbeddedVectorStore`]: local SQLite, one table per file
//! - [`redis::RedisVectorSink`]: external RediSearch server
//! - [`assistant::AssistantVectorStore`]: remote file + vector-store API

use crate::paragraph::ParagraphVector;
use crate::registry::FileRecord;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;

pub mod assistant;
pub mod embedded;
pub mod redis;

pub use assistant::AssistantVectorStore;
pub use embedded::EmbeddedVectorStore;
pub use redis::RedisVectorSink;

/// A retrieval query against one file's collection.
///
/// Carries the raw query text alongside an optional pre-computed embedding:
/// the embedded and Redis backends search by vector, while the remote
/// assistant-file store embeds server-side and only needs the text.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub text: String,
    pub vector: Option<Vec<f32>>,
}

/// One scored chunk returned from a sink search.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub paragraph_id: String,
    pub chunk_idx: u32,
    pub text: String,
    pub score: f32,
    pub page_n: Option<u32>,
}

/// Pluggable vector-storage backend.
///
/// Any call may fail transiently (network) or permanently (bad request);
/// the indexing worker treats every failure as recoverable, marks the file
/// incomplete and leaves already-written vectors in place for the next
/// pass's dedup to find.
#[async_trait]
pub trait VectorSink: Send + Sync {
    /// Paragraph ids the sink already holds for this file.
    ///
    /// A backend with no collection for the file yet returns an empty set,
    /// not an error.
    async fn existing_paragraph_ids(&self, file: &FileRecord) -> Result<HashSet<String>>;

    /// Lazily create the file's collection, sized to the embedding
    /// dimension. Idempotent. Returns the backend-specific collection id,
    /// which the caller persists into the file record.
    async fn ensure_collection(&self, file: &FileRecord, dimension: usize) -> Result<String>;

    /// Upsert paragraph vectors. Writing the same paragraph id twice must
    /// not fail (at-least-once safe).
    async fn write_vectors(&self, file: &FileRecord, vectors: &[ParagraphVector]) -> Result<()>;

    /// K-nearest search over the file's collection. Consumed by the
    /// retrieval agent, not by the pipeline itself.
    async fn search(
        &self,
        file: &FileRecord,
        query: &SearchQuery,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>>;

    /// Short backend identifier for logs and telemetry.
    fn backend_name(&self) -> &'static str;
}

/// Deterministic collection name from a storage key: the file stem with
/// anything outside `[A-Za-z0-9_]` replaced, so every backend accepts it as
/// an identifier.
pub fn collection_from_file_name(file_name: &str) -> String {
    let stem = std::path::Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    stem.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}
