//! The text-extraction collaborator interface.
//!
//! Extraction is an external concern: given raw file bytes, produce an
//! ordered list of paragraphs with page/position metadata. The pipeline
//! only depends on the [`ParagraphExtractor`] trait; the geometry-aware PDF
//! extractor lives outside this repository. [`PlainTextExtractor`] is the
//! bundled implementation for plain-text documents so the pipeline runs
//! end-to-end.

use crate::paragraph::ParagraphRecord;
use anyhow::Result;
use async_trait::async_trait;

/// Extracts ordered paragraphs from raw file bytes.
///
/// A single fallible operation: it may fail outright or return an empty
/// list, and the extraction worker treats both as a terminal error for the
/// file. A file still being written when it is read is expected to land in
/// one of those two cases.
#[async_trait]
pub trait ParagraphExtractor: Send + Sync {
    async fn extract(&self, bytes: &[u8], display_name: &str) -> Result<Vec<ParagraphRecord>>;
}

/// Blank-line paragraph splitting for plain-text and markdown documents.
///
/// Page numbers are always 1 and bounding boxes zeroed; plain text has no
/// geometry to report.
#[derive(Debug, Clone, Default)]
pub struct PlainTextExtractor;

#[async_trait]
impl ParagraphExtractor for PlainTextExtractor {
    async fn extract(&self, bytes: &[u8], display_name: &str) -> Result<Vec<ParagraphRecord>> {
        let text = String::from_utf8_lossy(bytes);

        let mut paragraphs = Vec::new();
        let mut current = String::new();

        for line in text.lines() {
            if line.trim().is_empty() {
                flush(&mut current, &mut paragraphs);
            } else {
                if !current.is_empty() {
                    current.push('\n');
                }
                current.push_str(line);
            }
        }
        flush(&mut current, &mut paragraphs);

        tracing::debug!(
            "Extracted {} paragraphs from {}",
            paragraphs.len(),
            display_name
        );
        Ok(paragraphs)
    }
}

fn flush(current: &mut String, paragraphs: &mut Vec<ParagraphRecord>) {
    if current.trim().is_empty() {
        current.clear();
        return;
    }
    paragraphs.push(ParagraphRecord {
        page_n: 1,
        section_number: None,
        paragraph_text: std::mem::take(current),
        paragraph_box: [0.0, 0.0, 0.0, 0.0],
        paragraph_id: None,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_splits_on_blank_lines() -> Result<()> {
        let extractor = PlainTextExtractor;
        let text = b"first paragraph\nstill first\n\nsecond paragraph\n\n\nthird";
        let paragraphs = extractor.extract(text, "doc.txt").await?;

        assert_eq!(paragraphs.len(), 3);
        assert_eq!(paragraphs[0].paragraph_text, "first paragraph\nstill first");
        assert_eq!(paragraphs[1].paragraph_text, "second paragraph");
        assert_eq!(paragraphs[2].paragraph_text, "third");
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_input_yields_no_paragraphs() -> Result<()> {
        let extractor = PlainTextExtractor;
        assert!(extractor.extract(b"", "empty.txt").await?.is_empty());
        assert!(extractor.extract(b"\n\n  \n", "blank.txt").await?.is_empty());
        Ok(())
    }
}
