pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::models::{ChipChunk, RetrievedChunk};
use std::cmp::Ordering;

/// Cosine similarity clamped to `[0, 1]`. Mismatched lengths and zero
/// vectors score 0.
pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }

    let mut dot = 0f32;
    let mut left_norm = 0f32;
    let mut right_norm = 0f32;
    for (a, b) in left.iter().zip(right) {
        dot += a * b;
        left_norm += a * a;
        right_norm += b * b;
    }

    let denominator = left_norm.sqrt() * right_norm.sqrt();
    if denominator == 0.0 || !denominator.is_finite() {
        return 0.0;
    }
    let similarity = dot / denominator;
    if similarity.is_nan() {
        0.0
    } else {
        similarity.clamp(0.0, 1.0)
    }
}

pub(crate) struct Candidate {
    pub sequence: u64,
    pub chunk: ChipChunk,
    pub document_name: String,
    pub document_type: Option<String>,
}

/// Scores candidates, drops those under the floor and keeps the best
/// `limit`, breaking ties by insertion order then chunk index.
pub(crate) fn rank(
    query: &[f32],
    candidates: impl IntoIterator<Item = Candidate>,
    min_similarity: f32,
    limit: usize,
) -> Vec<RetrievedChunk> {
    let mut scored: Vec<(f32, u64, RetrievedChunk)> = candidates
        .into_iter()
        .filter_map(|candidate| {
            let similarity = cosine_similarity(query, candidate.chunk.embedding.as_deref()?);
            (similarity >= min_similarity).then(|| {
                (
                    similarity,
                    candidate.sequence,
                    RetrievedChunk {
                        chunk: candidate.chunk,
                        similarity,
                        document_name: candidate.document_name,
                        document_type: candidate.document_type,
                    },
                )
            })
        })
        .collect();

    scored.sort_by(|left, right| {
        right
            .0
            .partial_cmp(&left.0)
            .unwrap_or(Ordering::Equal)
            .then(left.1.cmp(&right.1))
            .then(left.2.chunk.chunk_index.cmp(&right.2.chunk.chunk_index))
    });

    scored
        .into_iter()
        .take(limit)
        .map(|(_, _, retrieved)| retrieved)
        .collect()
}
