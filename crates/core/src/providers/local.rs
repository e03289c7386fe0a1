use crate::error::ServiceError;
use crate::services::{
    ChatMessage, CompletionService, EmbeddingService, IndexedEmbedding, PageImage,
    PageTextService,
};
use async_trait::async_trait;

pub const OFFLINE_REPLY: &str = "No reasoning service is configured (offline mode).";

/// Hashes character trigrams into a fixed number of buckets and
/// L2-normalizes the result.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl CharacterNgramEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let chars: Vec<char> = text.to_lowercase().chars().collect();

        for window in chars.windows(3) {
            let mut hash = 1469598103934665603u64;
            for character in window {
                let mut buffer = [0u8; 4];
                for byte in character.encode_utf8(&mut buffer).bytes() {
                    hash ^= byte as u64;
                    hash = hash.wrapping_mul(1099511628211);
                }
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingService for CharacterNgramEmbedder {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<IndexedEmbedding>, ServiceError> {
        Ok(inputs
            .iter()
            .enumerate()
            .map(|(index, input)| IndexedEmbedding {
                index,
                vector: self.vector(input),
            })
            .collect())
    }

    fn name(&self) -> &str {
        "character-ngram"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TextLayerOnly;

#[async_trait]
impl PageTextService for TextLayerOnly {
    async fn extract_page(&self, page: &PageImage, _instruction: &str) -> Result<String, ServiceError> {
        Err(ServiceError::InvalidResponse {
            service: "offline".to_string(),
            details: format!("page {} has no text layer and cannot be transcribed offline", page.page_number),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineCompletion;

#[async_trait]
impl CompletionService for OfflineCompletion {
    async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, ServiceError> {
        Ok(OFFLINE_REPLY.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedder_is_deterministic_and_normalized() {
        let embedder = CharacterNgramEmbedder::new(64);
        let first = embedder.vector("Monthly rent is due on the first");
        let second = embedder.vector("Monthly rent is due on the first");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);

        let norm = first.iter().map(|value| value * value).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn short_input_yields_zero_vector() {
        let vector = CharacterNgramEmbedder::new(8).vector("ab");
        assert!(vector.iter().all(|value| *value == 0.0));
    }

    #[tokio::test]
    async fn batch_preserves_indices() {
        let embedder = CharacterNgramEmbedder::new(16);
        let inputs = vec!["alpha".to_string(), "beta".to_string()];
        let response = embedder.embed(&inputs).await.expect("offline embed");
        assert_eq!(response.len(), 2);
        assert_eq!(response[1].index, 1);
        assert_eq!(response[1].vector, embedder.vector("beta"));
    }
}
