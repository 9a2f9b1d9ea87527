//! Token-bounded paragraph chunking.
//!
//! Paragraphs above a token ceiling are split by accumulating lines until
//! the running estimate crosses the per-chunk target, then flushing. The
//! token count is a deliberately crude `chars / 4` proxy, kept behind the
//! [`TokenEstimator`] trait so a real tokenizer could be swapped in without
//! touching the indexing worker. Chunk boundaries are not a correctness
//! property of any particular tokenizer.

/// Estimates how many tokens a piece of text will cost to embed.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// The `chars / 4` estimator.
///
/// Fast and wrong in the usual ways; close enough for deciding where to
/// split, which is all it is used for.
#[derive(Debug, Clone)]
pub struct CharsPerToken {
    chars_per_token: usize,
}

impl CharsPerToken {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for CharsPerToken {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenEstimator for CharsPerToken {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count().max(1).div_ceil(self.chars_per_token)
    }
}

/// Split `text` into token-bounded chunks.
///
/// A text estimated at or under `max_tokens` comes back as a single chunk,
/// unchanged. Above that, lines are accumulated while the estimate stays
/// within `target_tokens`; the line that would overflow starts the next
/// chunk, so the concatenation of all chunks reconstructs the input
/// exactly. A single line longer than the target becomes its own chunk.
pub fn chunk_text(
    text: &str,
    estimator: &dyn TokenEstimator,
    target_tokens: usize,
    max_tokens: usize,
) -> Vec<String> {
    if estimator.estimate(text) <= max_tokens {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut buff = String::new();

    for line in text.split_inclusive('\n') {
        if !buff.is_empty() && estimator.estimate(&buff) + estimator.estimate(line) > target_tokens
        {
            chunks.push(std::mem::take(&mut buff));
        }
        buff.push_str(line);
    }

    if !buff.is_empty() {
        chunks.push(buff);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> CharsPerToken {
        CharsPerToken::default()
    }

    #[test]
    fn test_short_text_is_a_single_unchanged_chunk() {
        let text = "a short paragraph\nwith two lines";
        let chunks = chunk_text(text, &estimator(), 256, 1024);
        assert_eq!(chunks, vec![text.to_string()]);
    }

    #[test]
    fn test_long_text_concatenation_reconstructs_input() {
        // Well above a 16-token ceiling so splitting definitely happens.
        let text = "line one is fairly long for a line\n".repeat(40);
        let chunks = chunk_text(&text, &estimator(), 8, 16);

        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), text);
        for chunk in &chunks {
            assert!(!chunk.is_empty());
        }
    }

    #[test]
    fn test_oversized_single_line_still_chunks() {
        let text = "x".repeat(500);
        let chunks = chunk_text(&text, &estimator(), 8, 16);
        // No newline to split on: the whole line is one chunk.
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_estimate_is_ceil_chars_over_four() {
        let est = CharsPerToken::default();
        assert_eq!(est.estimate(""), 1);
        assert_eq!(est.estimate("abcd"), 1);
        assert_eq!(est.estimate("abcde"), 2);
        assert_eq!(est.estimate(&"x".repeat(1024)), 256);
    }
}
