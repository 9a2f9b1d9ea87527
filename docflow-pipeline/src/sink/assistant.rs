//! Remote assistant-file vector store.
//!
//! Talks to an OpenAI-style Files + Vector Stores REST API: every paragraph
//! becomes an uploaded blob *and* an attachment of the file's remote vector
//! store, and the service computes embeddings server-side (the local vector
//! on [`ParagraphVector`] is ignored). Blob names are deterministic and
//! embed the paragraph id, so dedup can be recomputed from the blob list
//! plus the attachment list alone.
//!
//! This is by far the slowest backend per item; every request carries a
//! hard client timeout.

use super::{ScoredChunk, SearchQuery, VectorSink};
use crate::paragraph::ParagraphVector;
use crate::registry::FileRecord;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PAGE_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
struct RemoteFile {
    id: String,
    filename: String,
}

#[derive(Debug, Deserialize)]
struct RemoteVectorStore {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct Attachment {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    filename: String,
    score: f32,
    #[serde(default)]
    content: Vec<SearchContent>,
}

#[derive(Debug, Deserialize)]
struct SearchContent {
    #[serde(default)]
    text: String,
}

/// Remote assistant-file [`VectorSink`].
pub struct AssistantVectorStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AssistantVectorStore {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn check(&self, response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        bail!("{what} failed with HTTP {status}: {body}");
    }

    /// Remote vector store name for a file: original stem plus owner, so
    /// operators can recognize it in the provider console.
    fn store_name(file: &FileRecord) -> String {
        let stem = Path::new(&file.file_name_orig)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.file_name_orig.clone());
        format!("{stem}__user{}", file.user_id)
    }

    /// Deterministic blob name for one paragraph of a file.
    fn blob_name(file: &FileRecord, paragraph_id: &str) -> String {
        let stem = Path::new(&file.file_name_orig)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.file_name_orig.clone());
        format!("{stem}_{paragraph_id}.txt")
    }

    /// Recover the paragraph id embedded in a blob name.
    fn paragraph_id_from_blob_name(filename: &str) -> Option<String> {
        let pos = filename.rfind("_pid-")?;
        let id = filename[pos + 1..].trim_end_matches(".txt");
        Some(id.to_string())
    }

    async fn list_blobs(&self) -> Result<HashMap<String, String>> {
        let mut blobs = HashMap::new();
        let mut after: Option<String> = None;
        loop {
            let mut request = self
                .client
                .get(self.url("/files"))
                .bearer_auth(&self.api_key)
                .query(&[
                    ("purpose", "assistants".to_string()),
                    ("limit", PAGE_LIMIT.to_string()),
                ]);
            if let Some(after) = &after {
                request = request.query(&[("after", after)]);
            }

            let response = self.check(request.send().await?, "Listing files").await?;
            let page: Page<RemoteFile> = response.json().await?;

            after = page.data.last().map(|f| f.id.clone());
            for file in page.data {
                blobs.insert(file.filename, file.id);
            }
            if !page.has_more || after.is_none() {
                break;
            }
        }
        Ok(blobs)
    }

    async fn upload_blob(&self, filename: &str, text: &str) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(text.as_bytes().to_vec())
            .file_name(filename.to_string())
            .mime_str("text/plain")?;
        let form = reqwest::multipart::Form::new()
            .text("purpose", "assistants")
            .part("file", part);

        let response = self
            .client
            .post(self.url("/files"))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;
        let response = self.check(response, "Uploading paragraph blob").await?;
        let file: RemoteFile = response.json().await?;
        Ok(file.id)
    }

    async fn find_vector_store(&self, name: &str) -> Result<Option<String>> {
        let mut after: Option<String> = None;
        loop {
            let mut request = self
                .client
                .get(self.url("/vector_stores"))
                .bearer_auth(&self.api_key)
                .query(&[("limit", PAGE_LIMIT.to_string())]);
            if let Some(after) = &after {
                request = request.query(&[("after", after)]);
            }

            let response = self
                .check(request.send().await?, "Listing vector stores")
                .await?;
            let page: Page<RemoteVectorStore> = response.json().await?;

            if let Some(store) = page.data.iter().find(|s| s.name == name) {
                return Ok(Some(store.id.clone()));
            }
            after = page.data.last().map(|s| s.id.clone());
            if !page.has_more || after.is_none() {
                return Ok(None);
            }
        }
    }

    async fn create_vector_store(&self, name: &str) -> Result<String> {
        let response = self
            .client
            .post(self.url("/vector_stores"))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?;
        let response = self.check(response, "Creating vector store").await?;
        let store: RemoteVectorStore = response.json().await?;
        tracing::info!("Created vector store {} ({})", store.name, store.id);
        Ok(store.id)
    }

    async fn list_attachments(&self, vector_store_id: &str) -> Result<HashSet<String>> {
        let mut attached = HashSet::new();
        let mut after: Option<String> = None;
        loop {
            let mut request = self
                .client
                .get(self.url(&format!("/vector_stores/{vector_store_id}/files")))
                .bearer_auth(&self.api_key)
                .query(&[("limit", PAGE_LIMIT.to_string())]);
            if let Some(after) = &after {
                request = request.query(&[("after", after)]);
            }

            let response = self
                .check(request.send().await?, "Listing vector store files")
                .await?;
            let page: Page<Attachment> = response.json().await?;

            after = page.data.last().map(|a| a.id.clone());
            for attachment in page.data {
                attached.insert(attachment.id);
            }
            if !page.has_more || after.is_none() {
                break;
            }
        }
        Ok(attached)
    }

    async fn attach(&self, vector_store_id: &str, file_id: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/vector_stores/{vector_store_id}/files")))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "file_id": file_id }))
            .send()
            .await?;
        self.check(response, "Attaching blob to vector store")
            .await?;
        Ok(())
    }
}

#[async_trait]
impl VectorSink for AssistantVectorStore {
    async fn existing_paragraph_ids(&self, file: &FileRecord) -> Result<HashSet<String>> {
        // No remote store yet means nothing can be attached
        if file.vector_store_id.is_empty() {
            return Ok(HashSet::new());
        }

        let blobs = self.list_blobs().await?;
        let attached = self.list_attachments(&file.vector_store_id).await?;

        // A paragraph only counts once its blob exists AND is attached;
        // an upload that crashed before attaching gets finished by the
        // next write pass.
        let mut ids = HashSet::new();
        for (filename, file_id) in &blobs {
            if !attached.contains(file_id) {
                continue;
            }
            if let Some(paragraph_id) = Self::paragraph_id_from_blob_name(filename) {
                if *filename == Self::blob_name(file, &paragraph_id) {
                    ids.insert(paragraph_id);
                }
            }
        }
        Ok(ids)
    }

    async fn ensure_collection(&self, file: &FileRecord, _dimension: usize) -> Result<String> {
        if !file.vector_store_id.is_empty() {
            return Ok(file.vector_store_id.clone());
        }

        let name = Self::store_name(file);
        if let Some(id) = self.find_vector_store(&name).await? {
            return Ok(id);
        }
        self.create_vector_store(&name).await
    }

    async fn write_vectors(&self, file: &FileRecord, vectors: &[ParagraphVector]) -> Result<()> {
        if file.vector_store_id.is_empty() {
            return Err(anyhow!(
                "No vector store assigned to {}; ensure_collection must run first",
                file.file_name
            ));
        }

        // Re-assemble paragraphs: the remote service chunks server-side, so
        // one blob per paragraph, chunks concatenated in order.
        let mut order: Vec<&str> = Vec::new();
        let mut texts: HashMap<&str, Vec<(u32, &str)>> = HashMap::new();
        for vector in vectors {
            let entry = texts.entry(&vector.paragraph_id).or_default();
            if entry.is_empty() {
                order.push(&vector.paragraph_id);
            }
            entry.push((vector.chunk_idx, &vector.text));
        }

        let mut blobs = self.list_blobs().await?;
        let attached = self.list_attachments(&file.vector_store_id).await?;

        for paragraph_id in order {
            let mut chunks = texts.remove(paragraph_id).unwrap_or_default();
            chunks.sort_by_key(|(idx, _)| *idx);
            let text: String = chunks.iter().map(|(_, t)| *t).collect();

            let filename = Self::blob_name(file, paragraph_id);
            let blob_id = match blobs.get(&filename) {
                Some(id) => id.clone(),
                None => {
                    let id = self
                        .upload_blob(&filename, &text)
                        .await
                        .with_context(|| format!("Uploading paragraph {paragraph_id}"))?;
                    blobs.insert(filename.clone(), id.clone());
                    id
                }
            };

            if !attached.contains(&blob_id) {
                self.attach(&file.vector_store_id, &blob_id)
                    .await
                    .with_context(|| format!("Attaching paragraph {paragraph_id}"))?;
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        file: &FileRecord,
        query: &SearchQuery,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>> {
        if file.vector_store_id.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(self.url(&format!(
                "/vector_stores/{}/search",
                file.vector_store_id
            )))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "query": query.text,
                "max_num_results": limit,
            }))
            .send()
            .await?;
        let response = self.check(response, "Vector store search").await?;
        let page: Page<SearchHit> = response.json().await?;

        Ok(page
            .data
            .into_iter()
            .map(|hit| ScoredChunk {
                paragraph_id: Self::paragraph_id_from_blob_name(&hit.filename)
                    .unwrap_or_else(|| hit.filename.clone()),
                chunk_idx: 0,
                text: hit
                    .content
                    .into_iter()
                    .map(|c| c.text)
                    .collect::<Vec<_>>()
                    .join("\n"),
                score: hit.score,
                page_n: None,
            })
            .collect())
    }

    fn backend_name(&self) -> &'static str {
        "assistant"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> FileRecord {
        FileRecord::new("a1b2c3.pdf", "quarterly report.pdf", 42)
    }

    #[test]
    fn test_blob_name_round_trip() {
        let file = record();
        let name = AssistantVectorStore::blob_name(&file, "pid-0123456789abcdef");
        assert_eq!(name, "quarterly report_pid-0123456789abcdef.txt");
        assert_eq!(
            AssistantVectorStore::paragraph_id_from_blob_name(&name),
            Some("pid-0123456789abcdef".to_string())
        );
        assert_eq!(
            AssistantVectorStore::paragraph_id_from_blob_name("unrelated.txt"),
            None
        );
    }

    #[test]
    fn test_store_name_includes_owner() {
        assert_eq!(
            AssistantVectorStore::store_name(&record()),
            "quarterly report__user42"
        );
    }
}
