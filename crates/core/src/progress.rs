use crate::models::DocumentStatus;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extracting,
    Cleaning,
    Classifying,
    Chunking,
    Embedding,
    Storing,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extracting => "extracting",
            Stage::Cleaning => "cleaning",
            Stage::Classifying => "classifying",
            Stage::Chunking => "chunking",
            Stage::Embedding => "embedding",
            Stage::Storing => "storing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExtractionProgress {
    pub current_page: usize,
    pub total_pages: usize,
    pub percent_complete: f32,
}

impl ExtractionProgress {
    pub fn new(current_page: usize, total_pages: usize) -> Self {
        let percent_complete = if total_pages == 0 {
            100.0
        } else {
            (current_page as f32 / total_pages as f32 * 100.0).min(100.0)
        };
        Self {
            current_page,
            total_pages,
            percent_complete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    StageStarted {
        document_id: String,
        stage: Stage,
    },
    StageFinished {
        document_id: String,
        stage: Stage,
        elapsed_ms: u64,
    },
    Extraction {
        document_id: String,
        progress: ExtractionProgress,
    },
    Embedding {
        document_id: String,
        embedded: usize,
        total: usize,
    },
    Status {
        document_id: String,
        status: DocumentStatus,
        message: Option<String>,
    },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent) {
        let _ = event;
    }
}

pub struct NoopProgress;

impl ProgressSink for NoopProgress {}

impl ProgressSink for UnboundedSender<ProgressEvent> {
    fn on_event(&self, event: ProgressEvent) {
        let _ = self.send(event);
    }
}

impl<T: ProgressSink + ?Sized> ProgressSink for Arc<T> {
    fn on_event(&self, event: ProgressEvent) {
        (**self).on_event(event);
    }
}
