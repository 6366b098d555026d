//! Token-window text chunker.
//!
//! Splits filing text into overlapping windows of `chunk_size` tokens, each
//! window starting `chunk_size - overlap` tokens after the previous one. The
//! last window runs to the end of the token sequence and may be shorter.
//!
//! Chunk text is never re-encoded from tokens: a [`Tokenizer`] reports byte
//! spans and each chunk is the slice of the source from its first token's
//! start to its last token's end. Chunking is therefore a pure function of
//! `(text, chunk_size, overlap, tokenizer)`, which is what lets the index
//! omit chunk text and rebuild it later.
//!
//! Changing any of those four inputs shifts chunk boundaries. The
//! [`ChunkingProfile`] is persisted alongside the index so a drifted
//! configuration is rejected rather than silently mismatched.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::ops::Range;
use std::sync::Arc;

use crate::config::ChunkingConfig;
use crate::error::{RagError, Result};

/// Non-whitespace runs longer than this are split into several tokens.
const MAX_TOKEN_CHARS: usize = 32;

/// A deterministic, versioned tokenization scheme.
pub trait Tokenizer: Send + Sync {
    /// Versioned identifier recorded in the index header (e.g. `"word-v1"`).
    fn id(&self) -> &str;

    /// Byte ranges of each token, in order and non-overlapping.
    fn token_spans(&self, text: &str) -> Result<Vec<Range<usize>>>;
}

/// Whitespace-delimited tokenizer (`word-v1`).
///
/// A token is a run of non-whitespace characters plus the whitespace that
/// follows it; leading whitespace belongs to the first token. Spans tile
/// the whole input, so concatenating every token reproduces the text.
#[derive(Debug, Default, Clone, Copy)]
pub struct WordTokenizer;

impl Tokenizer for WordTokenizer {
    fn id(&self) -> &str {
        "word-v1"
    }

    fn token_spans(&self, text: &str) -> Result<Vec<Range<usize>>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut starts = vec![0usize];
        let mut prev_ws = true;
        let mut seen_word = false;
        let mut run_chars = 0usize;

        for (i, c) in text.char_indices() {
            let ws = c.is_whitespace();
            if !ws {
                if seen_word && (prev_ws || run_chars == MAX_TOKEN_CHARS) {
                    starts.push(i);
                    run_chars = 0;
                }
                run_chars += 1;
                seen_word = true;
            }
            prev_ws = ws;
        }

        let mut spans = Vec::with_capacity(starts.len());
        for (n, &start) in starts.iter().enumerate() {
            let end = starts.get(n + 1).copied().unwrap_or(text.len());
            spans.push(start..end);
        }
        Ok(spans)
    }
}

/// Tokenizer backed by a Hugging Face `tokenizer.json`.
#[cfg(feature = "hf-tokenizer")]
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    id: String,
}

#[cfg(feature = "hf-tokenizer")]
impl HfTokenizer {
    /// Load a tokenizer file. The id embeds a hash of the file contents so
    /// swapping vocabularies changes the chunking profile.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let mut inner = tokenizers::Tokenizer::from_bytes(&bytes).map_err(|e| {
            RagError::config(format!(
                "failed to load tokenizer {}: {}",
                path.display(),
                e
            ))
        })?;
        inner
            .with_truncation(None)
            .map_err(|e| RagError::config(format!("failed to disable truncation: {}", e)))?;
        inner.with_padding(None);

        let digest = hash_bytes(&bytes);
        Ok(Self {
            inner,
            id: format!("hf-{}", &digest[..12]),
        })
    }
}

#[cfg(feature = "hf-tokenizer")]
impl Tokenizer for HfTokenizer {
    fn id(&self) -> &str {
        &self.id
    }

    fn token_spans(&self, text: &str) -> Result<Vec<Range<usize>>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| RagError::config(format!("tokenization failed: {}", e)))?;
        Ok(encoding
            .get_offsets()
            .iter()
            .filter(|(start, end)| end > start)
            .map(|&(start, end)| start..end)
            .collect())
    }
}

/// Parameters that determine chunk boundaries, persisted with the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingProfile {
    pub chunk_size: usize,
    pub overlap: usize,
    pub tokenizer: String,
}

impl std::fmt::Display for ChunkingProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} tokens, {} overlap, tokenizer {}",
            self.chunk_size, self.overlap, self.tokenizer
        )
    }
}

/// A chunk window in token and byte coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkWindow {
    pub index: usize,
    pub tokens: Range<usize>,
    pub bytes: Range<usize>,
}

/// Overlapping token-window splitter.
#[derive(Clone)]
pub struct Chunker {
    tokenizer: Arc<dyn Tokenizer>,
    chunk_size: usize,
    overlap: usize,
}

impl Chunker {
    /// Fails with a configuration error when `overlap >= chunk_size`,
    /// which would otherwise never advance.
    pub fn new(tokenizer: Arc<dyn Tokenizer>, chunk_size: usize, overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(RagError::config("chunk_size must be > 0"));
        }
        if overlap >= chunk_size {
            return Err(RagError::config(format!(
                "overlap ({}) must be smaller than chunk_size ({})",
                overlap, chunk_size
            )));
        }
        Ok(Self {
            tokenizer,
            chunk_size,
            overlap,
        })
    }

    pub fn from_config(config: &ChunkingConfig) -> Result<Self> {
        let tokenizer: Arc<dyn Tokenizer> = match config.tokenizer.as_str() {
            "word-v1" => Arc::new(WordTokenizer),
            #[cfg(feature = "hf-tokenizer")]
            "hf" => {
                let path = config
                    .tokenizer_file
                    .as_ref()
                    .ok_or_else(|| RagError::config("chunking.tokenizer_file required"))?;
                Arc::new(HfTokenizer::from_file(path)?)
            }
            #[cfg(not(feature = "hf-tokenizer"))]
            "hf" => {
                return Err(RagError::config(
                    "tokenizer \"hf\" requires building with --features hf-tokenizer",
                ))
            }
            other => return Err(RagError::config(format!("unknown tokenizer '{}'", other))),
        };
        Self::new(tokenizer, config.chunk_size, config.overlap)
    }

    pub fn profile(&self) -> ChunkingProfile {
        ChunkingProfile {
            chunk_size: self.chunk_size,
            overlap: self.overlap,
            tokenizer: self.tokenizer.id().to_string(),
        }
    }

    /// Compute window boundaries without copying text.
    pub fn windows(&self, text: &str) -> Result<Vec<ChunkWindow>> {
        let spans = self.tokenizer.token_spans(text)?;
        let step = self.chunk_size - self.overlap;
        let mut windows = Vec::new();
        let mut start = 0usize;

        while start < spans.len() {
            let end = (start + self.chunk_size).min(spans.len());
            let lo = floor_char_boundary(text, spans[start].start);
            let hi = ceil_char_boundary(text, spans[end - 1].end);
            windows.push(ChunkWindow {
                index: windows.len(),
                tokens: start..end,
                bytes: lo..hi,
            });
            if end == spans.len() {
                break;
            }
            start += step;
        }

        Ok(windows)
    }

    /// Split `text` into ordered chunk strings. Empty text yields no chunks.
    pub fn chunk(&self, text: &str) -> Result<Vec<String>> {
        Ok(self
            .windows(text)?
            .into_iter()
            .map(|w| text[w.bytes].to_string())
            .collect())
    }

    /// Rebuild the chunk at `index`, or `None` if the text has fewer chunks.
    pub fn chunk_at(&self, text: &str, index: usize) -> Result<Option<String>> {
        Ok(self
            .windows(text)?
            .into_iter()
            .nth(index)
            .map(|w| text[w.bytes].to_string()))
    }
}

impl std::fmt::Debug for Chunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunker")
            .field("tokenizer", &self.tokenizer.id())
            .field("chunk_size", &self.chunk_size)
            .field("overlap", &self.overlap)
            .finish()
    }
}

/// Split text with the built-in `word-v1` tokenizer.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Result<Vec<String>> {
    Chunker::new(Arc::new(WordTokenizer), chunk_size, overlap)?.chunk(text)
}

/// SHA-256 hex digest of a chunk's text.
pub fn hash_text(text: &str) -> String {
    hash_bytes(text.as_bytes())
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn floor_char_boundary(text: &str, mut i: usize) -> usize {
    while i > 0 && !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(text: &str, mut i: usize) -> usize {
    i = i.min(text.len());
    while i < text.len() && !text.is_char_boundary(i) {
        i += 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_empty_text_has_no_chunks() {
        assert!(chunk_text("", 10, 2).unwrap().is_empty());
        assert!(chunk_text("  \n\t ", 10, 2).unwrap().is_empty());
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("Hello, world!", 1000, 200).unwrap();
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn test_overlap_equal_to_size_rejected() {
        let err = chunk_text("a b c", 5, 5).unwrap_err();
        assert!(matches!(err, RagError::Configuration(_)));
        let err = chunk_text("a b c", 5, 9).unwrap_err();
        assert!(matches!(err, RagError::Configuration(_)));
    }

    #[test]
    fn test_windows_for_2500_tokens() {
        let chunker = Chunker::new(Arc::new(WordTokenizer), 1000, 200).unwrap();
        let windows = chunker.windows(&words(2500)).unwrap();
        let ranges: Vec<_> = windows.iter().map(|w| w.tokens.clone()).collect();
        assert_eq!(ranges, vec![0..1000, 800..1800, 1600..2500]);
    }

    #[test]
    fn test_exact_multiple_does_not_emit_empty_tail() {
        let chunker = Chunker::new(Arc::new(WordTokenizer), 4, 1).unwrap();
        let windows = chunker.windows(&words(7)).unwrap();
        let ranges: Vec<_> = windows.iter().map(|w| w.tokens.clone()).collect();
        assert_eq!(ranges, vec![0..4, 3..7]);
    }

    #[test]
    fn test_word_tokens_tile_text() {
        let text = "  Item 1A.\tRisk   Factors\n\nOur business is subject to risk.  ";
        let spans = WordTokenizer.token_spans(text).unwrap();
        let rebuilt: String = spans.iter().map(|s| &text[s.clone()]).collect();
        assert_eq!(rebuilt, text);
        assert_eq!(spans.len(), 10);
        assert_eq!(&text[spans[0].clone()], "  Item ");
    }

    #[test]
    fn test_long_runs_are_split() {
        let run = "x".repeat(MAX_TOKEN_CHARS * 2 + 5);
        let spans = WordTokenizer.token_spans(&run).unwrap();
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].len(), MAX_TOKEN_CHARS);
    }

    #[test]
    fn test_multibyte_text_slices_cleanly() {
        let text = "Umsatz – 12 € Mio. ".repeat(40);
        let chunks = chunk_text(&text, 7, 3).unwrap();
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| !c.is_empty()));
    }

    #[test]
    fn test_coverage_without_gaps_or_extra_duplication() {
        let text = words(1234);
        let chunker = Chunker::new(Arc::new(WordTokenizer), 100, 30).unwrap();
        let windows = chunker.windows(&text).unwrap();
        let spans = WordTokenizer.token_spans(&text).unwrap();

        let mut covered = Vec::new();
        let mut next = 0usize;
        for w in &windows {
            assert!(w.tokens.start <= next, "gap before window {}", w.index);
            if w.index > 0 {
                let prev = &windows[w.index - 1];
                assert_eq!(prev.tokens.end - w.tokens.start, 30);
            }
            covered.extend(next.max(w.tokens.start)..w.tokens.end);
            next = w.tokens.end;
        }
        assert_eq!(covered, (0..spans.len()).collect::<Vec<_>>());
    }

    #[test]
    fn test_deterministic() {
        let text = words(777);
        let c1 = chunk_text(&text, 50, 10).unwrap();
        let c2 = chunk_text(&text, 50, 10).unwrap();
        assert_eq!(c1, c2);
    }

    #[test]
    fn test_chunk_at_matches_chunk() {
        let text = words(300);
        let chunker = Chunker::new(Arc::new(WordTokenizer), 64, 16).unwrap();
        let all = chunker.chunk(&text).unwrap();
        for (i, c) in all.iter().enumerate() {
            assert_eq!(chunker.chunk_at(&text, i).unwrap().as_ref(), Some(c));
        }
        assert_eq!(chunker.chunk_at(&text, all.len()).unwrap(), None);
    }

    #[test]
    fn test_profile_records_tokenizer() {
        let chunker = Chunker::new(Arc::new(WordTokenizer), 1000, 200).unwrap();
        let profile = chunker.profile();
        assert_eq!(profile.tokenizer, "word-v1");
        assert_eq!(profile.chunk_size, 1000);
        assert_eq!(profile.overlap, 200);
    }

    #[test]
    fn test_hash_text_stable() {
        assert_eq!(hash_text("abc"), hash_text("abc"));
        assert_ne!(hash_text("abc"), hash_text("abd"));
        assert_eq!(hash_text("").len(), 64);
    }
}
