use crate::cancel::CancellationToken;
use crate::config::EmbeddingConfig;
use crate::error::{IngestError, ServiceError};
use crate::models::ChipChunk;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::services::{EmbeddingService, IndexedEmbedding};
use std::sync::Arc;
use tracing::{debug, info};

pub struct Embedder {
    service: Arc<dyn EmbeddingService>,
    config: EmbeddingConfig,
}

impl Embedder {
    pub fn new(service: Arc<dyn EmbeddingService>, config: EmbeddingConfig) -> Self {
        Self { service, config }
    }

    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    pub async fn embed_chunks(
        &self,
        chunks: &mut [ChipChunk],
        document_id: &str,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), IngestError> {
        let batch_size = self.config.batch_size.max(1);
        let total = chunks.len();
        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(total);

        for (batch, group) in chunks.chunks(batch_size).enumerate() {
            cancel.checkpoint()?;
            let inputs: Vec<String> = group.iter().map(|chunk| chunk.text.clone()).collect();
            debug!(
                document_id,
                batch,
                size = inputs.len(),
                service = self.service.name(),
                "Embedding batch"
            );

            vectors.extend(self.embed_batch(batch, &inputs).await?);
            progress.on_event(ProgressEvent::Embedding {
                document_id: document_id.to_string(),
                embedded: vectors.len(),
                total,
            });
        }

        for (chunk, vector) in chunks.iter_mut().zip(vectors) {
            chunk.embedding = Some(vector);
        }

        info!(document_id, chunks = total, "Embedded chunks");
        Ok(())
    }

    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>, IngestError> {
        let mut vectors = self.embed_batch(0, &[query.to_string()]).await?;
        vectors
            .pop()
            .ok_or(IngestError::EmbeddingCount {
                expected: 1,
                actual: 0,
            })
    }

    async fn embed_batch(&self, batch: usize, inputs: &[String]) -> Result<Vec<Vec<f32>>, IngestError> {
        let response = self
            .config
            .retry
            .run("embedding", ServiceError::is_transient, |_| self.service.embed(inputs))
            .await
            .map_err(|exhausted| IngestError::EmbeddingFailed {
                batch,
                attempts: exhausted.attempts,
                source: exhausted.last_error,
            })?;

        align_embeddings(response, inputs.len(), self.config.dimensions)
    }
}

/// Orders vectors by their reported input index and checks count, index
/// range and dimensionality.
pub fn align_embeddings(
    mut response: Vec<IndexedEmbedding>,
    expected: usize,
    dimensions: usize,
) -> Result<Vec<Vec<f32>>, IngestError> {
    if response.len() != expected {
        return Err(IngestError::EmbeddingCount {
            expected,
            actual: response.len(),
        });
    }

    response.sort_by_key(|item| item.index);
    for (position, item) in response.iter().enumerate() {
        if item.index != position {
            return Err(IngestError::EmbeddingIndex(item.index));
        }
        if item.vector.len() != dimensions {
            return Err(IngestError::DimensionMismatch {
                expected: dimensions,
                actual: item.vector.len(),
            });
        }
    }

    Ok(response.into_iter().map(|item| item.vector).collect())
}
