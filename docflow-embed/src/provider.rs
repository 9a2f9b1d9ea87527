//! Embedding provider implementations

use crate::config::EmbedConfig;
use crate::error::{EmbedError, Result};
use async_trait::async_trait;
use serde::Deserialize;

/// Result of embedding generation
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    /// The generated embeddings, one per input text, input-aligned
    pub embeddings: Vec<Vec<f32>>,
    /// The dimension of each embedding vector
    pub dimension: usize,
}

impl EmbeddingResult {
    /// Create a new embedding result.
    ///
    /// The dimension is inferred from the first embedding vector and
    /// defaults to 0 when the result is empty.
    pub fn new(embeddings: Vec<Vec<f32>>) -> Self {
        let dimension = embeddings.first().map(|e| e.len()).unwrap_or(0);
        Self {
            embeddings,
            dimension,
        }
    }

    /// Number of embedding vectors in this result.
    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    /// Returns `true` if this result contains no embedding vectors.
    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}

/// Trait for embedding providers that can generate embeddings from text
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for a batch of texts.
    ///
    /// The returned embeddings are aligned with the input slice: the vector
    /// at position `i` embeds `texts[i]`.
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult>;

    /// Expected embedding dimension, when the provider knows it up front
    fn dimension_hint(&self) -> Option<usize>;

    /// Name/identifier of this provider
    fn provider_name(&self) -> &str;
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

/// OpenAI-compatible HTTP embedding provider.
///
/// Posts `{"model": ..., "input": [...]}` to the configured `/embeddings`
/// route. The service reports each vector with the index of the input it
/// belongs to and does not promise response order, so rows are re-sorted by
/// that index before alignment. No timeout is applied here; callers wrap
/// each request in their own deadline.
#[derive(Debug, Clone)]
pub struct HttpEmbeddingProvider {
    config: EmbedConfig,
    client: reqwest::Client,
}

impl HttpEmbeddingProvider {
    /// Create a provider from a validated configuration.
    pub fn new(config: EmbedConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            client: reqwest::Client::new(),
        })
    }

    /// Align response rows with the request batch.
    ///
    /// Sorts by the service-reported index, then checks count and (when
    /// configured) dimension before handing the vectors back input-aligned.
    fn align_rows(&self, mut rows: Vec<EmbeddingRow>, expected: usize) -> Result<Vec<Vec<f32>>> {
        if rows.len() != expected {
            return Err(EmbedError::ResponseMismatch {
                expected,
                got: rows.len(),
            });
        }

        rows.sort_by_key(|r| r.index);

        for (i, row) in rows.iter().enumerate() {
            if row.index != i {
                return Err(EmbedError::ResponseMismatch {
                    expected,
                    got: rows.len(),
                });
            }
            if let Some(dim) = self.config.dimension {
                if row.embedding.len() != dim {
                    return Err(EmbedError::DimensionMismatch {
                        expected: dim,
                        got: row.embedding.len(),
                    });
                }
            }
        }

        Ok(rows.into_iter().map(|r| r.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult::new(Vec::new()));
        }

        tracing::debug!(
            "Requesting {} embeddings from {}",
            texts.len(),
            self.config.endpoint
        );

        let mut request = self.client.post(self.config.embeddings_url()).json(
            &serde_json::json!({
                "model": self.config.model,
                "input": texts,
            }),
        );
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EmbedError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: EmbeddingsResponse = response.json().await?;
        let embeddings = self.align_rows(body.data, texts.len())?;
        Ok(EmbeddingResult::new(embeddings))
    }

    fn dimension_hint(&self) -> Option<usize> {
        self.config.dimension
    }

    fn provider_name(&self) -> &str {
        &self.config.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(server: &MockServer) -> HttpEmbeddingProvider {
        let config = EmbedConfig::new(format!("{}/v1", server.uri()), "test-model");
        HttpEmbeddingProvider::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_embeddings_resorted_by_index() {
        let server = MockServer::start().await;
        // Rows intentionally out of order; alignment must fix this.
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"index": 1, "embedding": [1.0, 1.0]},
                    {"index": 0, "embedding": [0.0, 0.0]},
                ]
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let texts = vec!["a".to_string(), "b".to_string()];
        let result = provider.embed_texts(&texts).await.unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result.dimension, 2);
        assert_eq!(result.embeddings[0], vec![0.0, 0.0]);
        assert_eq!(result.embeddings[1], vec![1.0, 1.0]);
    }

    #[tokio::test]
    async fn test_count_mismatch_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"index": 0, "embedding": [0.5]}]
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let texts = vec!["a".to_string(), "b".to_string()];
        let err = provider.embed_texts(&texts).await.unwrap_err();
        assert!(matches!(
            err,
            EmbedError::ResponseMismatch {
                expected: 2,
                got: 1
            }
        ));
    }

    #[tokio::test]
    async fn test_api_error_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let err = provider
            .embed_texts(&["a".to_string()])
            .await
            .unwrap_err();
        match err {
            EmbedError::Api { status, message } => {
                assert_eq!(status, 429);
                assert_eq!(message, "rate limited");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_batch_short_circuits() {
        // No mock mounted: an HTTP call would fail the test.
        let server = MockServer::start().await;
        let provider = provider_for(&server);
        let result = provider.embed_texts(&[]).await.unwrap();
        assert!(result.is_empty());
    }
}
