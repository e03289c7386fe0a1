use crate::error::StoreError;
use crate::models::{ChipChunk, RetrievedChunk, SourceDocument};
use async_trait::async_trait;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_document(&self, document: &SourceDocument) -> Result<(), StoreError>;

    async fn get_document(&self, document_id: &str) -> Result<Option<SourceDocument>, StoreError>;

    /// Overwrites an existing record; `NotFound` when the id is unknown.
    async fn update_document(&self, document: &SourceDocument) -> Result<(), StoreError>;

    /// Removes the record and every chunk that references it. Returns whether
    /// a record existed.
    async fn delete_document(&self, document_id: &str) -> Result<bool, StoreError>;

    async fn list_documents(&self) -> Result<Vec<SourceDocument>, StoreError>;
}

#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn insert_chunks(&self, chunks: &[ChipChunk]) -> Result<(), StoreError>;

    /// Deletes every chunk of the document and inserts `chunks` in one
    /// atomic step. Returns how many chunks were removed.
    async fn replace_chunks(&self, document_id: &str, chunks: &[ChipChunk]) -> Result<usize, StoreError>;

    async fn delete_chunks(&self, document_id: &str) -> Result<usize, StoreError>;

    async fn count_chunks(&self, document_id: &str) -> Result<usize, StoreError>;

    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<ChipChunk>, StoreError>;

    /// Chunks whose similarity to `query` is at least `min_similarity`,
    /// best first, at most `limit`.
    async fn search_similar(
        &self,
        query: &[f32],
        min_similarity: f32,
        limit: usize,
    ) -> Result<Vec<RetrievedChunk>, StoreError>;
}

pub trait KnowledgeStore: DocumentStore + ChunkStore {}

impl<T: DocumentStore + ChunkStore + ?Sized> KnowledgeStore for T {}
