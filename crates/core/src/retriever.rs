use crate::config::RetrievalConfig;
use crate::embeddings::Embedder;
use crate::error::SearchError;
use crate::models::RetrievedChunk;
use crate::traits::KnowledgeStore;
use std::sync::Arc;
use tracing::info;

pub struct Retriever {
    embedder: Arc<Embedder>,
    store: Arc<dyn KnowledgeStore>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(embedder: Arc<Embedder>, store: Arc<dyn KnowledgeStore>, config: RetrievalConfig) -> Self {
        Self {
            embedder,
            store,
            config,
        }
    }

    pub async fn retrieve(
        &self,
        query: &str,
        top_k: Option<usize>,
        min_similarity: Option<f32>,
    ) -> Result<Vec<RetrievedChunk>, SearchError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(SearchError::Request("query must not be empty".to_string()));
        }

        let top_k = top_k.unwrap_or(self.config.top_k);
        let min_similarity = min_similarity.unwrap_or(self.config.min_similarity);
        if !(0.0..=1.0).contains(&min_similarity) {
            return Err(SearchError::Request(format!(
                "min_similarity must be within [0, 1], got {min_similarity}"
            )));
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let vector = self.embedder.embed_query(query).await?;
        let hits = self.store.search_similar(&vector, min_similarity, top_k).await?;

        info!(
            top_k,
            min_similarity,
            hits = hits.len(),
            best = hits.first().map(|hit| hit.similarity).unwrap_or(0.0),
            "Retrieved chunks"
        );
        Ok(hits)
    }
}
