pub mod answer;
pub mod cancel;
pub mod chunking;
pub mod classifier;
pub mod cleaner;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod prompts;
pub mod providers;
pub mod render;
pub mod retriever;
pub mod retry;
pub mod services;
pub mod stores;
pub mod templates;
pub mod traits;

pub use answer::{Answer, AnswerGenerator};
pub use cancel::CancellationToken;
pub use chunking::{build_header, chunk_document, ChunkedDocument, ChunkingConfig};
pub use classifier::{parse_classification, Classifier};
pub use cleaner::{clean_text, cleaning_stats, CleaningOptions, CleaningStats};
pub use config::{
    ClassificationConfig, ConfigError, EmbeddingConfig, ExtractionConfig, PipelineConfig,
    RetrievalConfig,
};
pub use embeddings::Embedder;
pub use error::{IngestError, SearchError, ServiceError, StoreError};
pub use extractor::{ExtractedText, Extractor};
pub use ingest::{digest_file, discover_documents};
pub use models::{
    CancelOutcome, ChipChunk, ChipSet, ClassificationResult, DocumentStatus, IngestOutcome,
    ReprocessOutcome, RetrievedChunk, SourceDocument, StageTimings,
};
pub use orchestrator::{IngestHandle, Orchestrator};
pub use progress::{NoopProgress, ProgressEvent, ProgressSink, Stage};
pub use providers::{CharacterNgramEmbedder, OfflineCompletion, OpenAiClient, OpenAiConfig, TextLayerOnly};
pub use render::{PageRasterizer, PdfiumRasterizer, RenderedPage};
pub use retriever::Retriever;
pub use retry::RetryPolicy;
pub use services::{ChatMessage, CompletionService, EmbeddingService, PageTextService};
pub use stores::{MemoryStore, SqliteStore};
pub use templates::{DocumentTemplate, StaticTemplates, TemplateProvider};
pub use traits::{ChunkStore, DocumentStore, KnowledgeStore};
