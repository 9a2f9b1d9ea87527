//! # docflow-pipeline
//!
//! Document ingestion and vector-indexing pipeline: documents dropped into
//! a watched directory are registered in a durable file registry, run
//! through paragraph extraction, embedded in bounded-concurrency batches
//! and published into a pluggable vector sink for a downstream retrieval
//! agent to query.
//!
//! ## Pipeline Flow
//!
//! ```text
//! watched dir → IngestWatcher → FileRegistry → ExtractionWorker
//!                                    ↓               ↓
//!                              IndexingWorker ← <file>.jsonl
//!                                    ↓
//!                      EmbeddingProvider + VectorSink
//! ```
//!
//! The registry's `processing_status` column is the whole state machine:
//! `"" → extracted → processing → complete | incomplete | Error: ...`.
//! Indexing is idempotent (every pass recomputes what the sink already
//! holds and only touches the remainder), so crashes and partial failures
//! converge instead of duplicating work.

pub mod chunker;
pub mod config;
pub mod extract;
pub mod paragraph;
pub mod registry;
pub mod sink;
pub mod telemetry;
pub mod workers;

pub use config::{PipelineConfig, SinkBackend};
pub use registry::{FileRecord, FileRegistry, ProcessingStatus};
pub use sink::{ScoredChunk, SearchQuery, VectorSink};
pub use workers::{
    ExtractionWorker, IndexingConfig, IndexingWorker, IngestWatcher, WorkerSupervisor,
};
