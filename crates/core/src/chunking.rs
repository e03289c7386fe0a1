use crate::cleaner::SECTION_BREAK;
use crate::error::IngestError;
use crate::models::{ChipChunk, ChipSet, CONTENT_BOUNDARY};
use crate::prompts::chip_lines;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::ops::Range;

pub const METADATA_HEADER: &str = "[Document Metadata]";
pub const NO_CONTENT_MARKER: &str = "[No content]";

static RE_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\S+").unwrap());
static RE_SECTION_BREAK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?m)^[ \t]*{}[ \t]*$", regex::escape(SECTION_BREAK))).unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub target_words: usize,
    pub overlap_words: usize,
    pub min_words: usize,
    pub respect_sections: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_words: 400,
            overlap_words: 50,
            min_words: 75,
            respect_sections: true,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.target_words == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "target_words must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Words the window advances per step; never zero.
    pub fn step(&self) -> usize {
        self.target_words.saturating_sub(self.overlap_words).max(1)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkedDocument {
    pub chunks: Vec<ChipChunk>,
    pub mean_word_count: f64,
}

impl ChunkedDocument {
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

pub fn build_header(chips: &ChipSet) -> String {
    let mut header = String::from(METADATA_HEADER);
    header.push('\n');
    for line in chip_lines(chips) {
        header.push_str(&line);
        header.push('\n');
    }
    header.push_str(CONTENT_BOUNDARY);
    header.push('\n');
    header
}

pub fn chunk_document(
    document_id: &str,
    text: &str,
    chips: &ChipSet,
    config: &ChunkingConfig,
) -> Result<ChunkedDocument, IngestError> {
    config.validate()?;
    let header = build_header(chips);

    let sections = if config.respect_sections {
        split_sections(text)
    } else {
        vec![0..text.len()]
    };

    let mut segments: Vec<Range<usize>> = Vec::new();
    for section in sections {
        segments.extend(window_section(text, section, config));
    }

    if segments.len() > 1 {
        let last_words = word_count(&text[segments[segments.len() - 1].clone()]);
        if last_words < config.min_words {
            if let Some(last) = segments.pop() {
                if let Some(previous) = segments.last_mut() {
                    previous.end = last.end.max(previous.end);
                }
            }
        }
    }

    close_gaps(&mut segments, text.len());

    if segments.is_empty() {
        let body = format!("{header}{NO_CONTENT_MARKER}");
        return Ok(ChunkedDocument {
            chunks: vec![ChipChunk {
                chunk_id: make_chunk_id(document_id, 0, &body),
                document_id: document_id.to_string(),
                chunk_index: 0,
                word_count: 0,
                text: body,
                char_start: 0,
                char_end: 0,
                embedding: None,
            }],
            mean_word_count: 0.0,
        });
    }

    let chunks: Vec<ChipChunk> = segments
        .into_iter()
        .enumerate()
        .map(|(index, range)| {
            let content = &text[range.clone()];
            let body = format!("{header}{content}");
            let char_start = text[..range.start].chars().count();
            ChipChunk {
                chunk_id: make_chunk_id(document_id, index, &body),
                document_id: document_id.to_string(),
                chunk_index: index,
                word_count: word_count(content),
                char_start,
                char_end: char_start + content.chars().count(),
                text: body,
                embedding: None,
            }
        })
        .collect();

    let total_words: usize = chunks.iter().map(|chunk| chunk.word_count).sum();
    let mean_word_count = total_words as f64 / chunks.len() as f64;

    Ok(ChunkedDocument {
        chunks,
        mean_word_count,
    })
}

/// Byte ranges of sections; each break line opens the section after it.
fn split_sections(text: &str) -> Vec<Range<usize>> {
    let mut starts: Vec<usize> = vec![0];
    starts.extend(
        RE_SECTION_BREAK
            .find_iter(text)
            .map(|found| found.start())
            .filter(|start| *start > 0),
    );
    starts.push(text.len());
    starts.dedup();

    starts.windows(2).map(|pair| pair[0]..pair[1]).collect()
}

fn window_section(text: &str, section: Range<usize>, config: &ChunkingConfig) -> Vec<Range<usize>> {
    let offset = section.start;
    let words: Vec<Range<usize>> = RE_WORD
        .find_iter(&text[section])
        .map(|found| offset + found.start()..offset + found.end())
        .collect();

    if words.is_empty() {
        return Vec::new();
    }
    if words.len() <= config.target_words {
        return vec![words[0].start..words[words.len() - 1].end];
    }

    let step = config.step();
    let mut windows = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + config.target_words).min(words.len());
        windows.push(words[start].start..words[end - 1].end);
        if end == words.len() {
            break;
        }
        start += step;
    }
    windows
}

/// Stretches segments so that together they span `0..len`: the first starts
/// at zero, each one runs up to where the next begins, the last runs to the end.
fn close_gaps(segments: &mut [Range<usize>], len: usize) {
    let starts: Vec<usize> = segments.iter().skip(1).map(|segment| segment.start).collect();
    for (segment, next_start) in segments.iter_mut().zip(starts) {
        segment.end = segment.end.max(next_start);
    }
    if let Some(first) = segments.first_mut() {
        first.start = 0;
    }
    if let Some(last) = segments.last_mut() {
        last.end = len;
    }
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

fn make_chunk_id(document_id: &str, index: usize, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update((index as u64).to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(count: usize) -> String {
        (0..count)
            .map(|index| format!("w{index}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn config(target: usize, overlap: usize, min: usize) -> ChunkingConfig {
        ChunkingConfig {
            target_words: target,
            overlap_words: overlap,
            min_words: min,
            respect_sections: true,
        }
    }

    fn assert_covers(text: &str, chunks: &[ChipChunk]) {
        let chars: Vec<char> = text.chars().collect();
        let mut covered = vec![false; chars.len()];
        for chunk in chunks {
            let slice: String = chars[chunk.char_range()].iter().collect();
            assert_eq!(chunk.content(), slice);
            for flag in &mut covered[chunk.char_range()] {
                *flag = true;
            }
        }
        let uncovered: Vec<usize> = (0..chars.len()).filter(|position| !covered[*position]).collect();
        assert!(uncovered.is_empty(), "uncovered positions: {uncovered:?}");
    }

    #[test]
    fn header_lists_chips_and_ends_with_boundary() {
        let chips: ChipSet = [("property_address", "123 Main St"), ("tenant_name", "")]
            .into_iter()
            .collect();
        let chunked =
            chunk_document("doc-1", "The lease begins today.", &chips, &config(10, 2, 1))
                .expect("chunking should succeed");

        let text = &chunked.chunks[0].text;
        assert!(text.contains("\nProperty Address: 123 Main St\n"));
        assert!(!text.contains("Tenant Name"));
        assert!(text.starts_with(METADATA_HEADER));
        assert!(text.ends_with("[Content]\nThe lease begins today."));
    }

    #[test]
    fn windows_overlap_and_cover_every_character() {
        let text = format!(
            "{}\n\n---\n\n{}\n\n  indented line\twith tab\n\n---\n\n{}",
            words(120),
            words(37),
            words(9)
        );
        let chunked = chunk_document("doc-1", &text, &ChipSet::new(), &config(50, 10, 20))
            .expect("chunking should succeed");

        let indices: Vec<usize> = chunked.chunks.iter().map(|chunk| chunk.chunk_index).collect();
        assert_eq!(indices, (0..chunked.chunk_count()).collect::<Vec<_>>());
        assert_covers(&text, &chunked.chunks);
        assert!(chunked.chunks.iter().all(|chunk| chunk.word_count <= 50 + 20));
    }

    #[test]
    fn chip_value_cannot_shift_the_content_boundary() {
        let chips: ChipSet = [("notes", "see [Content]\nbelow")].into_iter().collect();
        let text = "Rent is due monthly.";
        let chunked = chunk_document("doc-1", text, &chips, &config(10, 2, 1))
            .expect("chunking should succeed");
        assert!(chunked.chunks[0].text.contains("Notes: see [Content] below\n"));
        assert_eq!(chunked.chunks[0].content(), text);
    }

    #[test]
    fn original_formatting_is_preserved() {
        let text = "Name      Amount\nRent\t1200\n\nSecond paragraph.";
        let chunked = chunk_document("doc-1", text, &ChipSet::new(), &config(400, 50, 1))
            .expect("chunking should succeed");
        assert_eq!(chunked.chunks.len(), 1);
        assert_eq!(chunked.chunks[0].content(), text);
    }

    #[test]
    fn trailing_undersized_segment_merges_into_previous() {
        let text = words(25);
        let chunked = chunk_document("doc-1", &text, &ChipSet::new(), &config(10, 0, 8))
            .expect("chunking should succeed");

        assert_eq!(chunked.chunk_count(), 2);
        assert_eq!(chunked.chunks[1].word_count, 15);
        assert_covers(&text, &chunked.chunks);
        assert_eq!(chunked.mean_word_count, 12.5);
    }

    #[test]
    fn chunks_reconstruct_text_without_overlap() {
        for text in ["a b c d", "  lead\n\nand trail  \n", "Alpha beta\n\n---\n\nGamma delta"] {
            let chunked = chunk_document("doc-1", text, &ChipSet::new(), &config(2, 0, 1))
                .expect("chunking should succeed");
            assert_covers(text, &chunked.chunks);
            let rebuilt: String = chunked.chunks.iter().map(|chunk| chunk.content()).collect();
            assert_eq!(rebuilt, text);
        }
    }

    #[test]
    fn single_undersized_chunk_is_kept() {
        let chunked = chunk_document("doc-1", "just three words", &ChipSet::new(), &config(400, 50, 75))
            .expect("chunking should succeed");
        assert_eq!(chunked.chunk_count(), 1);
        assert_eq!(chunked.chunks[0].word_count, 3);
    }

    #[test]
    fn empty_document_yields_no_content_chunk() {
        let chunked = chunk_document("doc-1", "  \n\n ", &ChipSet::new(), &ChunkingConfig::default())
            .expect("chunking should succeed");
        assert_eq!(chunked.chunk_count(), 1);
        assert!(chunked.chunks[0].text.ends_with("[Content]\n[No content]"));
        assert_eq!(chunked.chunks[0].word_count, 0);
    }

    #[test]
    fn overlap_not_below_target_still_terminates() {
        let text = words(8);
        let chunked = chunk_document("doc-1", &text, &ChipSet::new(), &config(5, 10, 1))
            .expect("chunking should succeed");
        assert_eq!(chunked.chunk_count(), 4);
        assert_covers(&text, &chunked.chunks);
    }

    #[test]
    fn zero_target_is_rejected() {
        let error = chunk_document("doc-1", "text", &ChipSet::new(), &config(0, 0, 0))
            .expect_err("zero target must fail");
        assert!(matches!(error, IngestError::InvalidChunkConfig(_)));
    }

    #[test]
    fn section_breaks_start_new_chunks() {
        let text = "Alpha beta\n\n---\n\nGamma delta";
        let chunked = chunk_document("doc-1", text, &ChipSet::new(), &config(400, 50, 1))
            .expect("chunking should succeed");
        assert_eq!(chunked.chunk_count(), 2);
        assert_eq!(chunked.chunks[0].content(), "Alpha beta\n\n");
        assert_eq!(chunked.chunks[1].content(), "---\n\nGamma delta");
        assert_covers(text, &chunked.chunks);

        let flat = ChunkingConfig {
            respect_sections: false,
            ..config(400, 50, 1)
        };
        let chunked = chunk_document("doc-1", text, &ChipSet::new(), &flat)
            .expect("chunking should succeed");
        assert_eq!(chunked.chunk_count(), 1);
    }

    #[test]
    fn chunk_ids_are_unique_and_stable() {
        let text = words(30);
        let first = chunk_document("doc-1", &text, &ChipSet::new(), &config(10, 2, 1))
            .expect("chunking should succeed");
        let second = chunk_document("doc-1", &text, &ChipSet::new(), &config(10, 2, 1))
            .expect("chunking should succeed");

        let ids: std::collections::HashSet<_> =
            first.chunks.iter().map(|chunk| chunk.chunk_id.clone()).collect();
        assert_eq!(ids.len(), first.chunk_count());
        assert_eq!(first, second);
    }
}
