//! Sliding-window re-chunking with page attribution.
//!
//! Segments longer than `size` characters are cut into windows of `size`
//! characters, each starting `size - overlap` characters after the previous
//! one. A window's pages are those whose reported byte spans its (trimmed)
//! range overlaps, so a window straddling a page break carries both pages.

use crate::error::ConfigError;
use crate::model::Chunk;
use crate::service::{PageSpan, RawSegment};
use std::iter::once;

/// Splits raw segments into bounded chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    size: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(size: usize, overlap: usize) -> Result<Self, ConfigError> {
        if size == 0 {
            return Err(ConfigError::Invalid("chunk size must be ≥ 1".into()));
        }
        if overlap >= size {
            return Err(ConfigError::Invalid(format!(
                "chunk overlap ({overlap}) must be smaller than chunk size ({size})"
            )));
        }
        Ok(Self { size, overlap })
    }

    /// Chunk every segment in order. Ids are `chunk-0000`, `chunk-0001`, ...
    /// across the whole document.
    pub fn split(&self, segments: &[RawSegment]) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for (index, segment) in segments.iter().enumerate() {
            let fallback_page = index as u32 + 1;
            for (start, end) in self.windows(&segment.text) {
                let id = format!("chunk-{:04}", chunks.len());
                let pages = pages_for(&segment.spans, start, end, fallback_page);
                let mut chunk = Chunk::new(id, &segment.text[start..end], pages);
                chunk.section = segment.section.clone();
                chunks.push(chunk);
            }
        }
        chunks
    }

    /// Trimmed, non-empty byte ranges of each window over `text`.
    fn windows(&self, text: &str) -> Vec<(usize, usize)> {
        let bounds: Vec<usize> = text
            .char_indices()
            .map(|(b, _)| b)
            .chain(once(text.len()))
            .collect();
        let n_chars = bounds.len() - 1;
        let step = self.size - self.overlap;

        let mut out = Vec::new();
        let mut start = 0;
        loop {
            let end = (start + self.size).min(n_chars);
            if let Some(range) = trimmed(text, bounds[start], bounds[end]) {
                out.push(range);
            }
            if end >= n_chars {
                break;
            }
            start += step;
        }
        out
    }
}

fn trimmed(text: &str, start: usize, end: usize) -> Option<(usize, usize)> {
    let slice = &text[start..end];
    let lead = slice.len() - slice.trim_start().len();
    let trail = slice.len() - slice.trim_end().len();
    (lead < slice.len()).then(|| (start + lead, end - trail))
}

/// Pages whose spans overlap `[start, end)`.
///
/// A range between spans takes the page of the span before it (or the
/// first span when it precedes them all); a segment without spans uses
/// `fallback`.
fn pages_for(spans: &[PageSpan], start: usize, end: usize, fallback: u32) -> Vec<u32> {
    let overlapping: Vec<u32> = spans
        .iter()
        .filter(|s| s.start < end && s.end > start)
        .map(|s| s.page)
        .collect();
    if !overlapping.is_empty() {
        return overlapping;
    }
    spans
        .iter()
        .rev()
        .find(|s| s.start <= start)
        .or_else(|| spans.first())
        .map(|s| vec![s.page])
        .unwrap_or_else(|| vec![fallback])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(chunks: &[Chunk]) -> Vec<&str> {
        chunks.iter().map(|c| c.text.as_str()).collect()
    }

    #[test]
    fn short_segment_is_one_chunk() {
        let chunker = Chunker::new(1500, 200).unwrap();
        let segment = RawSegment::single_page(3, "Short page.").with_section("Intro");
        let chunks = chunker.split(&[segment]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, "chunk-0000");
        assert_eq!(chunks[0].pages, vec![3]);
        assert_eq!(chunks[0].section.as_deref(), Some("Intro"));
    }

    #[test]
    fn long_segment_uses_sliding_window() {
        let chunker = Chunker::new(4, 1).unwrap();
        let chunks = chunker.split(&[RawSegment::single_page(1, "abcdefghij")]);
        assert_eq!(texts(&chunks), vec!["abcd", "defg", "ghij"]);
        let ids: Vec<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["chunk-0000", "chunk-0001", "chunk-0002"]);
        assert!(chunks.iter().all(|c| c.pages == vec![1]));
    }

    #[test]
    fn window_straddling_page_break_carries_both_pages() {
        let segment = RawSegment {
            text: "alpha\n\nbeta".into(),
            spans: vec![
                PageSpan { page: 1, start: 0, end: 5 },
                PageSpan { page: 2, start: 7, end: 11 },
            ],
            section: None,
        };
        let chunks = Chunker::new(6, 2).unwrap().split(&[segment]);
        assert_eq!(texts(&chunks), vec!["alpha", "a\n\nbet", "eta"]);
        assert_eq!(chunks[0].pages, vec![1]);
        assert_eq!(chunks[1].pages, vec![1, 2]);
        assert_eq!(chunks[2].pages, vec![2]);
    }

    #[test]
    fn blank_windows_and_segments_are_skipped() {
        let chunker = Chunker::new(3, 0).unwrap();
        let chunks = chunker.split(&[
            RawSegment::single_page(1, "   \n  "),
            RawSegment::single_page(2, "abc      def"),
        ]);
        assert_eq!(texts(&chunks), vec!["abc", "def"]);
        assert_eq!(chunks[0].id, "chunk-0000");
    }

    #[test]
    fn segment_without_spans_falls_back_to_position() {
        let segments = vec![
            RawSegment {
                text: "first".into(),
                ..RawSegment::default()
            },
            RawSegment {
                text: "second".into(),
                ..RawSegment::default()
            },
        ];
        let chunks = Chunker::new(100, 10).unwrap().split(&segments);
        assert_eq!(chunks[0].pages, vec![1]);
        assert_eq!(chunks[1].pages, vec![2]);
    }

    #[test]
    fn multibyte_text_is_split_on_char_boundaries() {
        let chunks = Chunker::new(3, 1)
            .unwrap()
            .split(&[RawSegment::single_page(1, "αβγδεζ")]);
        assert_eq!(texts(&chunks), vec!["αβγ", "γδε", "εζ"]);
    }

    #[test]
    fn pages_are_sorted_and_non_empty() {
        let segment = RawSegment {
            text: "x".repeat(50),
            spans: vec![
                PageSpan { page: 4, start: 0, end: 20 },
                PageSpan { page: 5, start: 20, end: 35 },
                PageSpan { page: 6, start: 35, end: 50 },
            ],
            section: None,
        };
        let chunks = Chunker::new(12, 5).unwrap().split(&[segment]);
        for chunk in &chunks {
            assert!(!chunk.pages.is_empty());
            assert!(chunk.pages.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn gap_between_spans_takes_preceding_page() {
        let spans = [
            PageSpan { page: 1, start: 0, end: 5 },
            PageSpan { page: 2, start: 10, end: 15 },
        ];
        assert_eq!(pages_for(&spans, 6, 8, 99), vec![1]);
        assert_eq!(pages_for(&[], 0, 3, 7), vec![7]);
    }

    #[test]
    fn overlap_must_be_smaller_than_size() {
        assert!(Chunker::new(10, 10).is_err());
        assert!(Chunker::new(0, 0).is_err());
        assert!(Chunker::new(10, 9).is_ok());
    }
}
