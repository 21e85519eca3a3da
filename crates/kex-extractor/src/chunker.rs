//! Chunker
//!
//! Splits source text into overlapping spans with absolute offsets. The
//! output is a pure function of `(text, config)`, which checkpoint
//! resumption relies on: re-chunking after a restart yields the same offsets.
//!
//! Split preference, for a window of at most `max_chars` bytes:
//! 1. the sentence boundary closest to the window end, if it lies within
//!    `boundary_tolerance` of it
//! 2. the last whitespace in the window
//! 3. a hard cut on a char boundary

use kex_core::{Chunk, ExtractionConfig, KexError, Result};

/// Chunking parameters (byte lengths)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    pub max_chars: usize,
    pub overlap_chars: usize,
    /// 0 means half of `max_chars`
    pub boundary_tolerance: usize,
}

impl ChunkConfig {
    /// Smallest window that always fits one UTF-8 character
    pub const MIN_MAX_CHARS: usize = 4;

    pub fn new(max_chars: usize, overlap_chars: usize) -> Self {
        Self {
            max_chars,
            overlap_chars,
            boundary_tolerance: 0,
        }
    }

    pub fn with_boundary_tolerance(mut self, tolerance: usize) -> Self {
        self.boundary_tolerance = tolerance;
        self
    }

    pub fn tolerance(&self) -> usize {
        if self.boundary_tolerance == 0 {
            self.max_chars / 2
        } else {
            self.boundary_tolerance.min(self.max_chars)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_chars < Self::MIN_MAX_CHARS {
            return Err(KexError::Config(format!(
                "max_chars must be at least {}",
                Self::MIN_MAX_CHARS
            )));
        }
        if self.overlap_chars >= self.max_chars {
            return Err(KexError::Config(
                "overlap_chars must be smaller than max_chars".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self::new(2000, 200)
    }
}

impl From<&ExtractionConfig> for ChunkConfig {
    fn from(config: &ExtractionConfig) -> Self {
        Self::new(config.max_chars, config.overlap_chars)
            .with_boundary_tolerance(config.boundary_tolerance_chars)
    }
}

/// Lazily chunk `text`
pub fn chunk<'a>(text: &'a str, config: &ChunkConfig) -> Result<Chunks<'a>> {
    config.validate()?;
    Ok(Chunks {
        text,
        config: *config,
        pos: 0,
        index: 0,
    })
}

/// Iterator over the chunks of one text
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    text: &'a str,
    config: ChunkConfig,
    pos: usize,
    index: usize,
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let text = self.text;
        let start = skip_whitespace(text, self.pos);
        if start >= text.len() {
            self.pos = text.len();
            return None;
        }

        let end = if text.len() - start <= self.config.max_chars {
            text.len()
        } else {
            self.split_point(start)
        };
        let chunk_end = start + text[start..end].trim_end().len();

        let chunk = Chunk {
            text: text[start..chunk_end].to_string(),
            start_offset: start,
            chunk_index: self.index,
        };
        self.index += 1;
        self.pos = if end >= text.len() {
            text.len()
        } else {
            self.next_start(start, end)
        };
        Some(chunk)
    }
}

impl Chunks<'_> {
    fn split_point(&self, start: usize) -> usize {
        let text = self.text;
        let limit = floor_char_boundary(text, start + self.config.max_chars);
        let min_end = limit.saturating_sub(self.config.tolerance()).max(start + 1);

        if let Some(b) = sentence_boundaries(text, start, limit)
            .into_iter()
            .rev()
            .find(|&b| b >= min_end)
        {
            return b;
        }
        if text[limit..].starts_with(char::is_whitespace) {
            return limit;
        }
        if let Some((i, _)) = text[start..limit]
            .char_indices()
            .rev()
            .find(|(i, c)| *i > 0 && c.is_whitespace())
        {
            return start + i;
        }
        limit
    }

    /// Start of the next chunk: `overlap_chars` back from `end`, moved forward
    /// to a sentence start, else a word start
    fn next_start(&self, start: usize, end: usize) -> usize {
        let text = self.text;
        let overlap = self.config.overlap_chars.min((end - start) / 2);
        if overlap == 0 {
            return end;
        }
        let first_after_start = start + text[start..].chars().next().map_or(1, char::len_utf8);
        let candidate = floor_char_boundary(text, end - overlap).max(first_after_start);

        let sentence_start = sentence_boundaries(text, start, end)
            .into_iter()
            .map(|b| skip_whitespace(text, b))
            .find(|&s| s >= candidate && s < end);
        if let Some(s) = sentence_start {
            return s;
        }

        let word_start = text[candidate..end]
            .char_indices()
            .find(|(i, c)| {
                let abs = candidate + i;
                !c.is_whitespace() && text[..abs].ends_with(char::is_whitespace)
            })
            .map(|(i, _)| candidate + i);
        word_start.unwrap_or(candidate)
    }
}

const TERMINATORS: [char; 3] = ['.', '!', '?'];
const CLOSERS: [char; 6] = ['"', '\'', ')', ']', '\u{201d}', '\u{2019}'];

/// Absolute offsets in `(start, limit]` where a sentence ends
///
/// A sentence ends after a terminator (and any closing quotes) that is
/// followed by whitespace or the end of text, and before a blank line.
fn sentence_boundaries(text: &str, start: usize, limit: usize) -> Vec<usize> {
    let mut out = Vec::new();
    for (i, c) in text[start..limit].char_indices() {
        let abs = start + i;
        if TERMINATORS.contains(&c) {
            let mut j = abs + c.len_utf8();
            while let Some(closer) = text[j..].chars().next().filter(|ch| CLOSERS.contains(ch)) {
                j += closer.len_utf8();
            }
            let at_break = j == text.len() || text[j..].starts_with(char::is_whitespace);
            if at_break && j <= limit && j > start {
                out.push(j);
            }
        } else if c == '\n' && abs > start && text[abs + 1..].starts_with('\n') {
            out.push(abs);
        }
    }
    out.sort_unstable();
    out.dedup();
    out
}

fn skip_whitespace(text: &str, pos: usize) -> usize {
    let rest = &text[pos.min(text.len())..];
    text.len() - rest.trim_start().len()
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn collect(text: &str, config: ChunkConfig) -> Vec<Chunk> {
        chunk(text, &config).unwrap().collect()
    }

    fn assert_offsets(text: &str, chunks: &[Chunk]) {
        for c in chunks {
            assert_eq!(&text[c.start_offset..c.end_offset()], c.text);
        }
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = collect("Jane Doe met with Acme Corp on March 3.", ChunkConfig::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_offset, 0);
        assert_eq!(chunks[0].chunk_index, 0);
    }

    #[test]
    fn test_empty_and_whitespace_text() {
        assert!(collect("", ChunkConfig::default()).is_empty());
        assert!(collect("   \n\t ", ChunkConfig::default()).is_empty());
    }

    #[test]
    fn test_prefers_boundary_closest_to_max() {
        let text = "One two three. Four five six. Seven eight nine.";
        let chunks = collect(text, ChunkConfig::new(30, 0));
        assert_eq!(chunks[0].text, "One two three. Four five six.");
        assert_eq!(chunks[1].text, "Seven eight nine.");
        assert_offsets(text, &chunks);
    }

    #[test]
    fn test_never_splits_mid_sentence_within_tolerance() {
        let text = "Short one. This second sentence is considerably longer than the first.";
        let chunks = collect(text, ChunkConfig::new(40, 0).with_boundary_tolerance(35));
        assert_eq!(chunks[0].text, "Short one.");
        assert_offsets(text, &chunks);
    }

    #[test]
    fn test_falls_back_to_word_boundary() {
        let text = "alpha beta gamma delta epsilon zeta eta theta";
        let chunks = collect(text, ChunkConfig::new(12, 0));
        for c in &chunks {
            assert!(c.text.len() <= 12);
            assert!(!c.text.starts_with(' ') && !c.text.ends_with(' '));
        }
        assert_eq!(chunks[0].text, "alpha beta");
        assert_offsets(text, &chunks);
    }

    #[test]
    fn test_hard_cut_respects_char_boundaries() {
        let text = "ééééééééééééééééé";
        let chunks = collect(text, ChunkConfig::new(5, 0));
        assert_offsets(text, &chunks);
        assert!(chunks.iter().all(|c| c.text.len() <= 5));
        let joined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(joined, text);
    }

    #[test]
    fn test_overlap_starts_at_sentence() {
        let text = "First sentence here. Second sentence here. Third sentence here. Fourth one.";
        let chunks = collect(text, ChunkConfig::new(45, 25));
        assert!(chunks.len() >= 2);
        assert_offsets(text, &chunks);
        let second = &chunks[1];
        assert!(second.start_offset < chunks[0].end_offset());
        assert_eq!(second.text.split('.').next(), Some("Second sentence here"));
    }

    #[test]
    fn test_indices_are_sequential() {
        let text = "a b c d e f g h i j k l m n o p q r s t u v w x y z ".repeat(20);
        let chunks = collect(&text, ChunkConfig::new(40, 10));
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i);
        }
    }

    #[test]
    fn test_invalid_config() {
        assert!(chunk("x", &ChunkConfig::new(10, 10)).is_err());
        assert!(chunk("x", &ChunkConfig::new(2, 0)).is_err());
    }

    #[test]
    fn test_paragraph_break_is_boundary() {
        let text = "heading without stop\n\nbody text that continues for a while";
        let chunks = collect(text, ChunkConfig::new(30, 0));
        assert_eq!(chunks[0].text, "heading without stop");
        assert_offsets(text, &chunks);
    }

    proptest! {
        #[test]
        fn prop_chunking_is_idempotent(
            text in "[a-zA-Z .!?\\n é]{0,400}",
            max in 4usize..120,
            overlap_pct in 0usize..90,
        ) {
            let config = ChunkConfig::new(max, max * overlap_pct / 100);
            let a: Vec<(usize, usize)> = chunk(&text, &config).unwrap()
                .map(|c| (c.start_offset, c.end_offset())).collect();
            let b: Vec<(usize, usize)> = chunk(&text, &config).unwrap()
                .map(|c| (c.start_offset, c.end_offset())).collect();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_chunks_are_exact_bounded_and_cover_text(
            text in "[a-zA-Z .!?\\n é]{0,400}",
            max in 4usize..120,
            overlap_pct in 0usize..90,
        ) {
            let config = ChunkConfig::new(max, max * overlap_pct / 100);
            let chunks: Vec<Chunk> = chunk(&text, &config).unwrap().collect();
            let mut covered = vec![false; text.len()];
            for c in &chunks {
                prop_assert!(c.text.len() <= max);
                prop_assert!(!c.text.is_empty());
                prop_assert_eq!(&text[c.start_offset..c.end_offset()], c.text.as_str());
                for flag in &mut covered[c.start_offset..c.end_offset()] {
                    *flag = true;
                }
            }
            for (i, ch) in text.char_indices() {
                if !ch.is_whitespace() {
                    prop_assert!(covered[i], "byte {} not covered", i);
                }
            }
        }
    }
}
