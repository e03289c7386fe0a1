use crate::cancel::CancellationToken;
use crate::chunking::chunk_document;
use crate::classifier::Classifier;
use crate::cleaner::{clean_text, cleaning_stats};
use crate::config::PipelineConfig;
use crate::embeddings::Embedder;
use crate::error::{IngestError, StoreError};
use crate::extractor::{detect_source_kind, Extractor};
use crate::ingest::{digest_file, file_name};
use crate::models::{
    CancelOutcome, ChipChunk, ChipSet, DocumentStatus, IngestOutcome, ReprocessOutcome,
    SourceDocument, StageTimings,
};
use crate::progress::{ProgressEvent, ProgressSink, Stage};
use crate::templates::{builtin_templates, DocumentTemplate, TemplateProvider};
use crate::traits::KnowledgeStore;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub type IngestHandle = JoinHandle<Result<IngestOutcome, IngestError>>;

pub struct Orchestrator {
    extractor: Extractor,
    classifier: Classifier,
    embedder: Arc<Embedder>,
    store: Arc<dyn KnowledgeStore>,
    templates: Arc<dyn TemplateProvider>,
    config: PipelineConfig,
    runs: Mutex<HashMap<String, CancellationToken>>,
}

impl Orchestrator {
    pub fn new(
        extractor: Extractor,
        classifier: Classifier,
        embedder: Arc<Embedder>,
        store: Arc<dyn KnowledgeStore>,
        templates: Arc<dyn TemplateProvider>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            extractor,
            classifier,
            embedder,
            store,
            templates,
            config,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub async fn ingest(
        &self,
        path: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<IngestOutcome, IngestError> {
        let (document, cancel) = self.register(path).await?;
        self.run_ingest(document, path, progress, cancel).await
    }

    /// Creates the document record, then runs ingestion in the background.
    /// The returned id can be passed to [`Orchestrator::cancel`] right away.
    pub async fn start_ingest(
        self: &Arc<Self>,
        path: PathBuf,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<(String, IngestHandle), IngestError> {
        let (document, cancel) = self.register(&path).await?;
        let document_id = document.id.clone();
        let orchestrator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            orchestrator
                .run_ingest(document, &path, progress.as_ref(), cancel)
                .await
        });
        Ok((document_id, handle))
    }

    /// Re-chunks and re-embeds the stored cleaned text with `custom_chips`
    /// layered over the auto chips, then swaps the chunk set atomically.
    pub async fn reprocess(
        &self,
        document_id: &str,
        custom_chips: ChipSet,
        progress: &dyn ProgressSink,
    ) -> Result<ReprocessOutcome, IngestError> {
        let mut document = self
            .store
            .get_document(document_id)
            .await?
            .ok_or_else(|| IngestError::DocumentNotFound(document_id.to_string()))?;
        let text = document
            .cleaned_text
            .clone()
            .ok_or_else(|| IngestError::MissingText(document_id.to_string()))?;

        let cancel = CancellationToken::new();
        {
            let mut runs = self.runs();
            if runs.contains_key(document_id) {
                return Err(IngestError::InvalidArgument(format!(
                    "document {document_id} is already being processed"
                )));
            }
            runs.insert(document_id.to_string(), cancel.clone());
        }

        let original = document.clone();
        document.custom_chips = document.custom_chips.merged_with(&custom_chips);
        let result = match self
            .reprocess_stages(&mut document, &text, progress, &cancel)
            .await
        {
            Ok(outcome) => self
                .set_status(&mut document, DocumentStatus::Complete, None, progress)
                .await
                .map(|()| outcome)
                .map_err(IngestError::from),
            Err(error) => Err(error),
        };
        self.runs().remove(document_id);

        match result {
            Ok(outcome) => {
                info!(
                    document_id,
                    previous_chunks = outcome.previous_chunk_count,
                    new_chunks = outcome.new_chunk_count,
                    "Reprocessing complete"
                );
                Ok(outcome)
            }
            Err(error) if error.is_cancelled() || cancel.is_cancelled() => {
                Err(self.restore(&original, progress).await)
            }
            Err(error) => Err(self.abandon(&mut document, progress, &cancel, error, false).await),
        }
    }

    /// Signals a running run. An ingestion that has not finished loses
    /// everything it wrote; a document with a persisted chunk set (complete,
    /// or being reprocessed) keeps its record and chunks.
    pub async fn cancel(&self, document_id: &str) -> Result<CancelOutcome, IngestError> {
        let document = self.store.get_document(document_id).await?;

        let token = self.runs().get(document_id).cloned();
        if let Some(token) = &token {
            token.cancel();
        }

        match &document {
            None => {
                debug!(document_id, signalled = token.is_some(), "Cancel requested for unknown document");
                return Ok(CancelOutcome {
                    chunks_deleted: 0,
                    document_deleted: false,
                    already_complete: false,
                });
            }
            Some(found) if found.status.has_persisted_chunks() => {
                info!(
                    document_id,
                    status = found.status.as_str(),
                    signalled = token.is_some(),
                    "Cancel requested for a persisted document, chunks kept"
                );
                return Ok(CancelOutcome {
                    chunks_deleted: 0,
                    document_deleted: false,
                    already_complete: true,
                });
            }
            Some(_) => {}
        }

        let chunks_deleted = self.store.delete_chunks(document_id).await?;
        let document_deleted = self.store.delete_document(document_id).await?;
        info!(document_id, chunks_deleted, document_deleted, "Cancelled document");

        Ok(CancelOutcome {
            chunks_deleted,
            document_deleted,
            already_complete: false,
        })
    }

    pub fn is_running(&self, document_id: &str) -> bool {
        self.runs().contains_key(document_id)
    }

    pub async fn documents(&self) -> Result<Vec<SourceDocument>, IngestError> {
        Ok(self.store.list_documents().await?)
    }

    pub async fn document(&self, document_id: &str) -> Result<Option<SourceDocument>, IngestError> {
        Ok(self.store.get_document(document_id).await?)
    }

    pub async fn chunks(&self, document_id: &str) -> Result<Vec<ChipChunk>, IngestError> {
        Ok(self.store.chunks_for_document(document_id).await?)
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn register(&self, path: &Path) -> Result<(SourceDocument, CancellationToken), IngestError> {
        detect_source_kind(path)?;
        let name = file_name(path)?;
        let source = path.to_path_buf();
        let checksum = tokio::task::spawn_blocking(move || digest_file(&source))
            .await
            .map_err(|error| IngestError::Task(error.to_string()))??;

        let document = SourceDocument::pending(
            Uuid::new_v4().to_string(),
            name,
            path.display().to_string(),
            checksum,
        );
        self.store.insert_document(&document).await?;

        let cancel = CancellationToken::new();
        self.runs().insert(document.id.clone(), cancel.clone());
        info!(document_id = %document.id, file = %document.file_name, "Registered document");
        Ok((document, cancel))
    }

    async fn run_ingest(
        &self,
        mut document: SourceDocument,
        path: &Path,
        progress: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Result<IngestOutcome, IngestError> {
        let started = Instant::now();
        let result = match self
            .ingest_stages(&mut document, path, progress, &cancel, started)
            .await
        {
            Ok(outcome) => self
                .set_status(&mut document, DocumentStatus::Complete, None, progress)
                .await
                .map(|()| outcome)
                .map_err(IngestError::from),
            Err(error) => Err(error),
        };
        self.runs().remove(&document.id);

        match result {
            Ok(outcome) => {
                info!(
                    document_id = %outcome.document_id,
                    file_type = %outcome.classification.file_type,
                    chunks = outcome.chunk_count,
                    failed_pages = outcome.failed_pages.len(),
                    total_ms = outcome.timings.total_ms,
                    "Ingestion complete"
                );
                Ok(outcome)
            }
            Err(error) => Err(self.abandon(&mut document, progress, &cancel, error, true).await),
        }
    }

    async fn ingest_stages(
        &self,
        document: &mut SourceDocument,
        path: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<IngestOutcome, IngestError> {
        let document_id = document.id.clone();
        let mut timings = StageTimings::default();

        cancel.checkpoint()?;
        self.set_status(document, DocumentStatus::Processing, None, progress)
            .await?;

        let clock = self
            .enter_stage(document, Stage::Extracting, progress, cancel)
            .await?;
        let extracted = self
            .extractor
            .extract(path, &document_id, progress, cancel)
            .await?;
        timings.extract_ms = finish_stage(progress, &document_id, Stage::Extracting, clock);

        let clock = self
            .enter_stage(document, Stage::Cleaning, progress, cancel)
            .await?;
        let cleaned = clean_text(&extracted.text, &self.config.cleaning);
        let stats = cleaning_stats(&extracted.text, &cleaned);
        debug!(
            document_id = %document_id,
            reduction_percent = stats.reduction_percent,
            page_markers = stats.page_markers_removed,
            "Cleaned extracted text"
        );
        document.cleaned_text = Some(cleaned.clone());
        timings.clean_ms = finish_stage(progress, &document_id, Stage::Cleaning, clock);

        let clock = self
            .enter_stage(document, Stage::Classifying, progress, cancel)
            .await?;
        let templates = self.load_templates().await;
        let classification = self.classifier.classify(&cleaned, &templates).await;
        document.document_type = Some(classification.file_type.clone());
        document.auto_chips = classification.chips.clone();
        timings.classify_ms = finish_stage(progress, &document_id, Stage::Classifying, clock);

        let clock = self
            .enter_stage(document, Stage::Chunking, progress, cancel)
            .await?;
        let mut chunked = chunk_document(
            &document_id,
            &cleaned,
            &document.effective_chips(),
            &self.config.chunking,
        )?;
        debug!(
            document_id = %document_id,
            chunks = chunked.chunk_count(),
            mean_words = chunked.mean_word_count,
            "Chunked document"
        );
        timings.chunk_ms = finish_stage(progress, &document_id, Stage::Chunking, clock);

        let clock = self
            .enter_stage(document, Stage::Embedding, progress, cancel)
            .await?;
        self.embedder
            .embed_chunks(&mut chunked.chunks, &document_id, progress, cancel)
            .await?;
        timings.embed_ms = finish_stage(progress, &document_id, Stage::Embedding, clock);

        let clock = self
            .enter_stage(document, Stage::Storing, progress, cancel)
            .await?;
        self.store.insert_chunks(&chunked.chunks).await?;
        document.chunk_count = chunked.chunk_count();
        timings.store_ms = finish_stage(progress, &document_id, Stage::Storing, clock);
        timings.total_ms = elapsed_ms(started);

        Ok(IngestOutcome {
            document_id,
            classification,
            chunk_count: chunked.chunk_count(),
            failed_pages: extracted.failed_pages,
            timings,
        })
    }

    async fn reprocess_stages(
        &self,
        document: &mut SourceDocument,
        text: &str,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ReprocessOutcome, IngestError> {
        let document_id = document.id.clone();
        self.set_status(document, DocumentStatus::Reprocessing, None, progress)
            .await?;

        let clock = self
            .enter_stage(document, Stage::Chunking, progress, cancel)
            .await?;
        let mut chunked = chunk_document(
            &document_id,
            text,
            &document.effective_chips(),
            &self.config.chunking,
        )?;
        finish_stage(progress, &document_id, Stage::Chunking, clock);

        let clock = self
            .enter_stage(document, Stage::Embedding, progress, cancel)
            .await?;
        self.embedder
            .embed_chunks(&mut chunked.chunks, &document_id, progress, cancel)
            .await?;
        finish_stage(progress, &document_id, Stage::Embedding, clock);

        let clock = self
            .enter_stage(document, Stage::Storing, progress, cancel)
            .await?;
        let previous_chunk_count = self
            .store
            .replace_chunks(&document_id, &chunked.chunks)
            .await?;
        document.chunk_count = chunked.chunk_count();
        finish_stage(progress, &document_id, Stage::Storing, clock);

        Ok(ReprocessOutcome {
            previous_chunk_count,
            new_chunk_count: chunked.chunk_count(),
        })
    }

    async fn enter_stage(
        &self,
        document: &mut SourceDocument,
        stage: Stage,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Instant, IngestError> {
        cancel.checkpoint()?;
        document.status_message = Some(stage.as_str().to_string());
        self.store.update_document(document).await?;

        progress.on_event(ProgressEvent::StageStarted {
            document_id: document.id.clone(),
            stage,
        });
        debug!(document_id = %document.id, stage = stage.as_str(), "Stage started");
        Ok(Instant::now())
    }

    async fn set_status(
        &self,
        document: &mut SourceDocument,
        status: DocumentStatus,
        message: Option<String>,
        progress: &dyn ProgressSink,
    ) -> Result<(), StoreError> {
        document.status = status;
        document.status_message = message.clone();
        if status == DocumentStatus::Complete {
            document.processed_at = Some(Utc::now());
        }
        self.store.update_document(document).await?;

        progress.on_event(ProgressEvent::Status {
            document_id: document.id.clone(),
            status,
            message,
        });
        Ok(())
    }

    async fn load_templates(&self) -> Vec<DocumentTemplate> {
        match self.templates.templates().await {
            Ok(templates) => templates,
            Err(error) => {
                warn!(error = %error, "Template provider failed, using built-in templates");
                builtin_templates()
            }
        }
    }

    async fn abandon(
        &self,
        document: &mut SourceDocument,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
        failure: IngestError,
        discard_chunks: bool,
    ) -> IngestError {
        if failure.is_cancelled() || cancel.is_cancelled() {
            self.roll_back(document, progress).await;
            return IngestError::Cancelled;
        }

        error!(document_id = %document.id, error = %failure, "Run failed");
        if discard_chunks {
            if let Err(cleanup) = self.store.delete_chunks(&document.id).await {
                warn!(document_id = %document.id, error = %cleanup, "Failed to discard partial chunks");
            }
            document.chunk_count = 0;
        }
        if let Err(store_error) = self
            .set_status(document, DocumentStatus::Error, Some(failure.to_string()), progress)
            .await
        {
            warn!(document_id = %document.id, error = %store_error, "Failed to record error status");
        }
        failure
    }

    /// Writes back the record as it was before a cancelled reprocess. The
    /// previous chunk set was never replaced.
    async fn restore(&self, original: &SourceDocument, progress: &dyn ProgressSink) -> IngestError {
        match self.store.update_document(original).await {
            Ok(()) => progress.on_event(ProgressEvent::Status {
                document_id: original.id.clone(),
                status: original.status,
                message: original.status_message.clone(),
            }),
            Err(store_error) => {
                warn!(document_id = %original.id, error = %store_error, "Failed to restore document after cancel");
            }
        }
        info!(
            document_id = %original.id,
            chunks = original.chunk_count,
            "Reprocess cancelled, previous chunks kept"
        );
        IngestError::Cancelled
    }

    async fn roll_back(&self, document: &mut SourceDocument, progress: &dyn ProgressSink) {
        let message = Some("cancelled".to_string());
        // cancel() may already have removed the record.
        match self
            .set_status(document, DocumentStatus::Cancelled, message, progress)
            .await
        {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(store_error) => {
                warn!(document_id = %document.id, error = %store_error, "Failed to record cancelled status");
            }
        }

        let chunks_deleted = self
            .store
            .delete_chunks(&document.id)
            .await
            .unwrap_or_else(|cleanup| {
                warn!(document_id = %document.id, error = %cleanup, "Failed to delete chunks");
                0
            });
        let document_deleted = self
            .store
            .delete_document(&document.id)
            .await
            .unwrap_or_else(|cleanup| {
                warn!(document_id = %document.id, error = %cleanup, "Failed to delete document");
                false
            });
        info!(document_id = %document.id, chunks_deleted, document_deleted, "Run cancelled");
    }
}

fn finish_stage(progress: &dyn ProgressSink, document_id: &str, stage: Stage, clock: Instant) -> u64 {
    let elapsed_ms = elapsed_ms(clock);
    progress.on_event(ProgressEvent::StageFinished {
        document_id: document_id.to_string(),
        stage,
        elapsed_ms,
    });
    info!(document_id, stage = stage.as_str(), elapsed_ms, "Stage finished");
    elapsed_ms
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}
