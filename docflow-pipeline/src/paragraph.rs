//! Paragraph records and the per-file JSONL artifact.
//!
//! Extraction persists one [`ParagraphRecord`] per line into
//! `<file_name>.jsonl` next to the source document; indexing reads the same
//! artifact on every pass. Paragraph ids are derived from the paragraph text
//! alone, so re-extracting an unchanged document yields the same ids and
//! re-processing stays idempotent.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One extracted unit of document text with page/position metadata.
///
/// Field names are the on-disk JSONL schema and must stay stable: the
/// artifact is shared with the extraction collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParagraphRecord {
    /// 1-based page number the paragraph was found on
    pub page_n: u32,
    /// Section identifier, when the extractor recognized one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_number: Option<String>,
    /// The paragraph text
    pub paragraph_text: String,
    /// Bounding box on the page: x0, y0, x1, y1
    pub paragraph_box: [f32; 4],
    /// Content-derived id; assigned by the pipeline when missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paragraph_id: Option<String>,
}

impl ParagraphRecord {
    /// Assign the content-derived id if the extractor did not provide one.
    pub fn ensure_id(&mut self) {
        if self.paragraph_id.is_none() {
            self.paragraph_id = Some(paragraph_id(&self.paragraph_text));
        }
    }
}

/// An embedding-ready chunk of one paragraph.
///
/// A paragraph that exceeds the token ceiling is split into several chunks,
/// distinguished by `chunk_idx`. Produced by the indexing worker and handed
/// straight to the vector sink; never persisted by the pipeline itself.
#[derive(Debug, Clone)]
pub struct ParagraphVector {
    pub paragraph_id: String,
    pub chunk_idx: u32,
    pub text: String,
    pub page_n: u32,
    pub paragraph_box: [f32; 4],
    /// Filled in once the embedding service answered for this chunk
    pub embedding: Option<Vec<f32>>,
}

/// Derive a stable paragraph id from the paragraph text.
///
/// Truncated blake3 of the text; stable across re-extraction, which is what
/// makes dedup against the sink meaningful.
pub fn paragraph_id(text: &str) -> String {
    let hash = blake3::hash(text.as_bytes());
    format!("pid-{}", &hash.to_hex().as_str()[..16])
}

/// Path of the paragraph JSONL artifact for a stored file.
pub fn paragraph_file_path(files_dir: &Path, file_name: &str) -> PathBuf {
    files_dir.join(file_name).with_extension("jsonl")
}

/// Write the paragraph artifact, one JSON object per line.
pub async fn write_paragraphs(path: &Path, paragraphs: &[ParagraphRecord]) -> Result<()> {
    let mut out = String::new();
    for paragraph in paragraphs {
        out.push_str(&serde_json::to_string(paragraph)?);
        out.push('\n');
    }
    tokio::fs::write(path, out)
        .await
        .with_context(|| format!("Failed to write paragraph file {}", path.display()))?;
    Ok(())
}

/// Read the paragraph artifact back, skipping blank lines.
pub async fn read_paragraphs(path: &Path) -> Result<Vec<ParagraphRecord>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read paragraph file {}", path.display()))?;

    let mut paragraphs = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: ParagraphRecord = serde_json::from_str(line).with_context(|| {
            format!("Malformed paragraph record at {}:{}", path.display(), line_no + 1)
        })?;
        paragraphs.push(record);
    }
    Ok(paragraphs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_paragraph_id_is_stable_and_content_derived() {
        let a = paragraph_id("some paragraph text");
        let b = paragraph_id("some paragraph text");
        let c = paragraph_id("different text");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("pid-"));
        assert_eq!(a.len(), "pid-".len() + 16);
    }

    #[tokio::test]
    async fn test_jsonl_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let path = paragraph_file_path(dir.path(), "doc1.pdf");

        let mut records = vec![
            ParagraphRecord {
                page_n: 1,
                section_number: Some("2.1".to_string()),
                paragraph_text: "First paragraph".to_string(),
                paragraph_box: [0.0, 10.0, 100.0, 40.0],
                paragraph_id: None,
            },
            ParagraphRecord {
                page_n: 2,
                section_number: None,
                paragraph_text: "Second paragraph".to_string(),
                paragraph_box: [0.0, 50.0, 100.0, 80.0],
                paragraph_id: None,
            },
        ];
        for record in &mut records {
            record.ensure_id();
        }

        write_paragraphs(&path, &records).await?;
        let loaded = read_paragraphs(&path).await?;
        assert_eq!(loaded, records);
        Ok(())
    }
}
