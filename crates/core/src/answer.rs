use crate::error::SearchError;
use crate::models::RetrievedChunk;
use crate::prompts::{answer_context, ANSWER_SYSTEM_PROMPT};
use crate::retriever::Retriever;
use crate::services::{ChatMessage, CompletionService};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<RetrievedChunk>,
}

pub struct AnswerGenerator {
    retriever: Arc<Retriever>,
    completion: Arc<dyn CompletionService>,
}

impl AnswerGenerator {
    pub fn new(retriever: Arc<Retriever>, completion: Arc<dyn CompletionService>) -> Self {
        Self {
            retriever,
            completion,
        }
    }

    /// `history` is replayed verbatim, oldest first, between the context and
    /// the question.
    pub async fn answer(
        &self,
        question: &str,
        history: &[ChatMessage],
        top_k: Option<usize>,
        min_similarity: Option<f32>,
    ) -> Result<Answer, SearchError> {
        let sources = self
            .retriever
            .retrieve(question, top_k, min_similarity)
            .await?;

        let messages = build_messages(question, history, &sources);
        let answer = self.completion.complete(&messages).await?;

        info!(
            sources = sources.len(),
            history = history.len(),
            answer_chars = answer.chars().count(),
            "Generated answer"
        );
        Ok(Answer {
            answer: answer.trim().to_string(),
            sources,
        })
    }
}

fn build_messages(question: &str, history: &[ChatMessage], sources: &[RetrievedChunk]) -> Vec<ChatMessage> {
    let excerpts: Vec<(String, f32, String)> = sources
        .iter()
        .map(|hit| {
            (
                hit.document_name.clone(),
                hit.similarity,
                hit.chunk.content().to_string(),
            )
        })
        .collect();

    let mut messages = Vec::with_capacity(history.len() + 3);
    messages.push(ChatMessage::system(ANSWER_SYSTEM_PROMPT));
    messages.push(ChatMessage::system(format!(
        "Document excerpts:\n\n{}",
        answer_context(&excerpts)
    )));
    messages.extend(history.iter().cloned());
    messages.push(ChatMessage::user(question.trim()));
    messages
}
