use super::{rank, Candidate};
use crate::error::StoreError;
use crate::models::{ChipChunk, RetrievedChunk, SourceDocument};
use crate::traits::{ChunkStore, DocumentStore};
use async_trait::async_trait;
use tokio::sync::RwLock;

#[derive(Default)]
struct MemoryState {
    documents: Vec<SourceDocument>,
    /// `(insertion sequence, chunk)` in insertion order.
    chunks: Vec<(u64, ChipChunk)>,
    next_sequence: u64,
}

impl MemoryState {
    fn has_document(&self, document_id: &str) -> bool {
        self.documents.iter().any(|document| document.id == document_id)
    }

    fn push_chunks(&mut self, chunks: &[ChipChunk]) -> Result<(), StoreError> {
        if let Some(orphan) = chunks.iter().find(|chunk| !self.has_document(&chunk.document_id)) {
            return Err(StoreError::NotFound(orphan.document_id.clone()));
        }
        for chunk in chunks {
            self.next_sequence += 1;
            self.chunks.push((self.next_sequence, chunk.clone()));
        }
        Ok(())
    }

    fn remove_chunks(&mut self, document_id: &str) -> usize {
        let before = self.chunks.len();
        self.chunks.retain(|(_, chunk)| chunk.document_id != document_id);
        before - self.chunks.len()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_document(&self, document: &SourceDocument) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.has_document(&document.id) {
            return Err(StoreError::Duplicate(document.id.clone()));
        }
        state.documents.push(document.clone());
        Ok(())
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<SourceDocument>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .documents
            .iter()
            .find(|document| document.id == document_id)
            .cloned())
    }

    async fn update_document(&self, document: &SourceDocument) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        match state.documents.iter_mut().find(|existing| existing.id == document.id) {
            Some(existing) => {
                *existing = document.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(document.id.clone())),
        }
    }

    async fn delete_document(&self, document_id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let before = state.documents.len();
        state.documents.retain(|document| document.id != document_id);
        let existed = state.documents.len() != before;
        state.remove_chunks(document_id);
        Ok(existed)
    }

    async fn list_documents(&self) -> Result<Vec<SourceDocument>, StoreError> {
        let state = self.state.read().await;
        let mut documents: Vec<SourceDocument> = state.documents.iter().rev().cloned().collect();
        documents.sort_by(|left, right| right.uploaded_at.cmp(&left.uploaded_at));
        Ok(documents)
    }
}

#[async_trait]
impl ChunkStore for MemoryStore {
    async fn insert_chunks(&self, chunks: &[ChipChunk]) -> Result<(), StoreError> {
        self.state.write().await.push_chunks(chunks)
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[ChipChunk]) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        if !state.has_document(document_id) {
            return Err(StoreError::NotFound(document_id.to_string()));
        }
        if let Some(foreign) = chunks.iter().find(|chunk| chunk.document_id != document_id) {
            return Err(StoreError::Corrupt {
                id: foreign.chunk_id.clone(),
                details: format!("chunk belongs to {}, not {document_id}", foreign.document_id),
            });
        }
        let removed = state.remove_chunks(document_id);
        state.push_chunks(chunks)?;
        Ok(removed)
    }

    async fn delete_chunks(&self, document_id: &str) -> Result<usize, StoreError> {
        Ok(self.state.write().await.remove_chunks(document_id))
    }

    async fn count_chunks(&self, document_id: &str) -> Result<usize, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .chunks
            .iter()
            .filter(|(_, chunk)| chunk.document_id == document_id)
            .count())
    }

    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<ChipChunk>, StoreError> {
        let state = self.state.read().await;
        let mut chunks: Vec<ChipChunk> = state
            .chunks
            .iter()
            .filter(|(_, chunk)| chunk.document_id == document_id)
            .map(|(_, chunk)| chunk.clone())
            .collect();
        chunks.sort_by_key(|chunk| chunk.chunk_index);
        Ok(chunks)
    }

    async fn search_similar(
        &self,
        query: &[f32],
        min_similarity: f32,
        limit: usize,
    ) -> Result<Vec<RetrievedChunk>, StoreError> {
        let state = self.state.read().await;
        let candidates = state.chunks.iter().filter_map(|(sequence, chunk)| {
            let document = state
                .documents
                .iter()
                .find(|document| document.id == chunk.document_id)?;
            Some(Candidate {
                sequence: *sequence,
                chunk: chunk.clone(),
                document_name: document.file_name.clone(),
                document_type: document.document_type.clone(),
            })
        });
        Ok(rank(query, candidates, min_similarity, limit))
    }
}
