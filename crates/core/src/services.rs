use crate::error::ServiceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PageImage {
    pub page_number: usize,
    pub mime_type: String,
    pub base64_data: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexedEmbedding {
    pub index: usize,
    pub vector: Vec<f32>,
}

#[async_trait]
pub trait PageTextService: Send + Sync {
    async fn extract_page(&self, page: &PageImage, instruction: &str)
        -> Result<String, ServiceError>;
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ServiceError>;
}

#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Embeds every input; the response may arrive in any order but each
    /// vector carries the index of its input.
    async fn embed(&self, inputs: &[String]) -> Result<Vec<IndexedEmbedding>, ServiceError>;

    fn name(&self) -> &str;
}
