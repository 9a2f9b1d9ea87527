//! Configuration for embedding providers

use crate::error::{EmbedError, Result};

/// Configuration for an OpenAI-compatible embedding endpoint.
///
/// The endpoint is the base URL up to and including the API version segment
/// (e.g. `https://api.example.com/v1`); the provider appends `/embeddings`.
#[derive(Debug, Clone)]
pub struct EmbedConfig {
    /// Base URL of the embedding service, without the `/embeddings` suffix
    pub endpoint: String,
    /// Model identifier sent with every request
    pub model: String,
    /// Bearer token, if the service requires one
    pub api_key: Option<String>,
    /// Expected embedding dimension; responses are validated against it
    /// when set
    pub dimension: Option<usize>,
}

impl EmbedConfig {
    /// Create a new embedding configuration with defaults.
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: None,
            dimension: None,
        }
    }

    /// Attach a bearer token.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Declare the expected embedding dimension.
    ///
    /// When set, every response vector is checked against it and a
    /// mismatch is reported as an error rather than silently stored.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = Some(dimension);
        self
    }

    /// Validate that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(EmbedError::invalid_config("endpoint must not be empty"));
        }
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(EmbedError::invalid_config(format!(
                "endpoint must be an http(s) URL, got: {}",
                self.endpoint
            )));
        }
        if self.model.is_empty() {
            return Err(EmbedError::invalid_config("model must not be empty"));
        }
        Ok(())
    }

    /// Full URL of the embeddings route.
    pub fn embeddings_url(&self) -> String {
        format!("{}/embeddings", self.endpoint.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let config = EmbedConfig::new("http://localhost:8080/v1", "test-model");
        assert!(config.validate().is_ok());
        assert_eq!(
            config.embeddings_url(),
            "http://localhost:8080/v1/embeddings"
        );

        let bad = EmbedConfig::new("localhost:8080", "test-model");
        assert!(bad.validate().is_err());

        let empty_model = EmbedConfig::new("http://localhost:8080/v1", "");
        assert!(empty_model.validate().is_err());
    }

    #[test]
    fn test_trailing_slash_normalized() {
        let config = EmbedConfig::new("http://localhost:8080/v1/", "m");
        assert_eq!(
            config.embeddings_url(),
            "http://localhost:8080/v1/embeddings"
        );
    }
}
