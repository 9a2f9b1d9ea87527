//! # docflow-embed
//!
//! Client library for remote text-embedding services, designed for async
//! operation with a clean provider abstraction so the pipeline can swap
//! endpoints (or mock them in tests) without touching indexing logic.
//!
//! ## Features
//!
//! - **OpenAI-compatible HTTP provider**: talks to any `/embeddings`
//!   endpoint that accepts a batched `input` array
//! - **Async-First Design**: full async/await support with tokio integration
//! - **Index-aligned batches**: response rows are re-sorted by their `index`
//!   field before being matched back to inputs, since the service does not
//!   guarantee stable ordering
//! - **Configurable**: endpoint, model, credentials and expected dimension
//!   with sensible defaults
//!
//! ## Quick Start
//!
//! ```no_run
//! use docflow_embed::{EmbedConfig, EmbeddingProvider, HttpEmbeddingProvider};
//!
//! # async fn example() -> docflow_embed::Result<()> {
//! let config = EmbedConfig::new("http://localhost:8080/v1", "text-embedding-3-small");
//! let provider = HttpEmbeddingProvider::new(config)?;
//!
//! let texts = vec!["Hello world".to_string(), "How are you?".to_string()];
//! let result = provider.embed_texts(&texts).await?;
//!
//! println!("Generated {} embeddings of dimension {}",
//!          result.len(), result.dimension);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`config`]: endpoint and model configuration
//! - [`provider`]: the [`EmbeddingProvider`] trait and HTTP implementation
//! - [`error`]: error types and result handling
//!
//! ## Error Handling
//!
//! All operations return [`Result<T>`] using the crate's [`EmbedError`]
//! type, which distinguishes configuration problems, transport failures and
//! malformed service responses.

pub mod config;
pub mod error;
pub mod provider;

pub use config::EmbedConfig;
pub use error::{EmbedError, Result};
pub use provider::{EmbeddingProvider, EmbeddingResult, HttpEmbeddingProvider};
