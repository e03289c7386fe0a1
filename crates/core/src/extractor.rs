use crate::cancel::CancellationToken;
use crate::config::ExtractionConfig;
use crate::error::{IngestError, ServiceError};
use crate::progress::{ExtractionProgress, ProgressEvent, ProgressSink};
use crate::prompts::PAGE_EXTRACTION_PROMPT;
use crate::render::{read_text_layer, PageRasterizer, RenderedPage};
use crate::services::{PageImage, PageTextService};
use base64::{engine::general_purpose::STANDARD, Engine};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, warn};

pub const PAGE_MARKER_PATTERN: &str = r"=== Page \d+ of \d+ ===";

pub fn page_marker(page: usize, total: usize) -> String {
    format!("=== Page {page} of {total} ===")
}

pub fn failed_page_marker(page: usize) -> String {
    format!("[Page {page}: text extraction failed]")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Pdf,
    PlainText,
}

pub fn detect_source_kind(path: &Path) -> Result<SourceKind, IngestError> {
    let extension = path
        .extension()
        .and_then(|value| value.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("pdf") => return Ok(SourceKind::Pdf),
        Some("txt" | "text" | "md" | "markdown") => return Ok(SourceKind::PlainText),
        _ => {}
    }

    let mut magic = [0u8; 4];
    let mut file = std::fs::File::open(path)?;
    let read = file.read(&mut magic)?;
    if read == magic.len() && &magic == b"%PDF" {
        Ok(SourceKind::Pdf)
    } else {
        Err(IngestError::UnsupportedSource(path.display().to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedText {
    pub text: String,
    pub page_count: usize,
    pub failed_pages: Vec<usize>,
}

pub struct Extractor {
    pages: Arc<dyn PageTextService>,
    rasterizer: Arc<dyn PageRasterizer>,
    config: ExtractionConfig,
}

impl Extractor {
    pub fn new(
        pages: Arc<dyn PageTextService>,
        rasterizer: Arc<dyn PageRasterizer>,
        config: ExtractionConfig,
    ) -> Self {
        Self {
            pages,
            rasterizer,
            config,
        }
    }

    pub async fn extract(
        &self,
        path: &Path,
        document_id: &str,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ExtractedText, IngestError> {
        match detect_source_kind(path)? {
            SourceKind::PlainText => {
                let text = tokio::fs::read_to_string(path).await?;
                progress.on_event(ProgressEvent::Extraction {
                    document_id: document_id.to_string(),
                    progress: ExtractionProgress::new(1, 1),
                });
                Ok(ExtractedText {
                    text,
                    page_count: 1,
                    failed_pages: Vec::new(),
                })
            }
            SourceKind::Pdf => self.extract_pdf(path, document_id, progress, cancel).await,
        }
    }

    async fn extract_pdf(
        &self,
        path: &Path,
        document_id: &str,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ExtractedText, IngestError> {
        let workspace = self.create_workspace()?;
        let text_layer = if self.config.prefer_text_layer {
            self.load_text_layer(path).await
        } else {
            Vec::new()
        };

        let needs_rendering = text_layer.is_empty()
            || text_layer
                .iter()
                .any(|layer| layer.chars().count() < self.config.min_text_layer_chars);
        let mut rendered: Vec<Option<RenderedPage>> = if needs_rendering {
            match self.render_pages(path, workspace.path()).await {
                Ok(pages) => pages.into_iter().map(Some).collect(),
                Err(error) if !text_layer.is_empty() => {
                    warn!(document_id, error = %error, "Rendering failed, pages without a text layer will be marked");
                    Vec::new()
                }
                Err(error) => return Err(error),
            }
        } else {
            Vec::new()
        };

        let total_pages = if text_layer.is_empty() {
            rendered.len()
        } else {
            text_layer.len()
        };

        info!(
            document_id,
            total_pages,
            workspace = %workspace.path().display(),
            "Starting page extraction"
        );

        let mut text = String::new();
        let mut failed_pages = Vec::new();

        for index in 0..total_pages {
            cancel.checkpoint()?;
            let page_number = index + 1;

            let layer_text = text_layer
                .get(index)
                .filter(|layer| layer.chars().count() >= self.config.min_text_layer_chars);

            let body = match layer_text {
                Some(layer) => {
                    debug!(document_id, page = page_number, "Using embedded text layer");
                    Some(layer.clone())
                }
                None => {
                    let page = rendered.get_mut(index).and_then(Option::take);
                    self.transcribe_page(page_number, page).await
                }
            };

            text.push_str(&page_marker(page_number, total_pages));
            text.push('\n');
            match body {
                Some(body) => text.push_str(body.trim()),
                None => {
                    failed_pages.push(page_number);
                    text.push_str(&failed_page_marker(page_number));
                }
            }
            text.push_str("\n\n");

            progress.on_event(ProgressEvent::Extraction {
                document_id: document_id.to_string(),
                progress: ExtractionProgress::new(page_number, total_pages),
            });
        }

        if let Err(error) = workspace.close() {
            warn!(document_id, error = %error, "Failed to remove page workspace");
        }

        Ok(ExtractedText {
            text,
            page_count: total_pages,
            failed_pages,
        })
    }

    async fn render_pages(&self, path: &Path, workspace: &Path) -> Result<Vec<RenderedPage>, IngestError> {
        let rasterizer = Arc::clone(&self.rasterizer);
        let source = path.to_path_buf();
        let target = workspace.to_path_buf();
        tokio::task::spawn_blocking(move || rasterizer.render_pages(&source, &target))
            .await
            .map_err(|error| IngestError::Task(error.to_string()))?
    }

    /// Sends one rendered page to the page-to-text service. `None` means the
    /// page failed.
    async fn transcribe_page(&self, page_number: usize, rendered: Option<RenderedPage>) -> Option<String> {
        let target = match rendered {
            Some(Ok(target)) => target,
            Some(Err(error)) => {
                warn!(page = page_number, error = %error, "Page rasterization failed");
                return None;
            }
            None => {
                warn!(page = page_number, "Page has no rendered image");
                return None;
            }
        };

        let bytes = match tokio::fs::read(&target).await {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(page = page_number, error = %error, "Rendered page image is unreadable");
                return None;
            }
        };
        let _ = tokio::fs::remove_file(&target).await;

        let image = PageImage {
            page_number,
            mime_type: "image/png".to_string(),
            base64_data: STANDARD.encode(bytes),
        };

        let result = self
            .config
            .retry
            .run("page_extraction", ServiceError::is_transient, |_| {
                self.pages.extract_page(&image, PAGE_EXTRACTION_PROMPT)
            })
            .await;

        match result {
            Ok(text) => Some(text),
            Err(exhausted) => {
                warn!(
                    page = page_number,
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "Page text extraction failed"
                );
                None
            }
        }
    }

    fn create_workspace(&self) -> Result<TempDir, IngestError> {
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let prefix = format!("docchip-{run_id}-");
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let workspace = match &self.config.workspace_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        Ok(workspace)
    }

    async fn load_text_layer(&self, path: &Path) -> Vec<String> {
        let source = path.to_path_buf();
        match tokio::task::spawn_blocking(move || read_text_layer(&source)).await {
            Ok(Ok(pages)) => pages,
            Ok(Err(error)) => {
                warn!(error = %error, "Text layer unavailable, rasterizing every page");
                Vec::new()
            }
            Err(error) => {
                warn!(error = %error, "Text layer task failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct FakeRasterizer {
        pages: usize,
        loads: AtomicUsize,
    }

    impl FakeRasterizer {
        fn new(pages: usize) -> Self {
            Self {
                pages,
                loads: AtomicUsize::new(0),
            }
        }
    }

    impl PageRasterizer for FakeRasterizer {
        fn render_pages(&self, _path: &Path, workspace: &Path) -> Result<Vec<RenderedPage>, IngestError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok((1..=self.pages)
                .map(|page_number| -> RenderedPage {
                    let target = workspace.join(crate::render::page_file_name(page_number));
                    std::fs::write(&target, format!("page-{page_number}"))?;
                    Ok(target)
                })
                .collect())
        }
    }

    /// Transcribes pages as "text of page N" and always fails `failing_page`.
    struct FakePageText {
        failing_page: Option<usize>,
        failure_status: u16,
        calls: AtomicUsize,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl FakePageText {
        fn new(failing_page: Option<usize>) -> Self {
            Self {
                failing_page,
                failure_status: 500,
                calls: AtomicUsize::new(0),
                cancel_after: None,
            }
        }
    }

    #[async_trait]
    impl PageTextService for FakePageText {
        async fn extract_page(
            &self,
            page: &PageImage,
            instruction: &str,
        ) -> Result<String, ServiceError> {
            assert_eq!(instruction, PAGE_EXTRACTION_PROMPT);
            let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((limit, token)) = &self.cancel_after {
                if calls >= *limit {
                    token.cancel();
                }
            }
            if Some(page.page_number) == self.failing_page {
                return Err(ServiceError::Status {
                    service: "fake".to_string(),
                    status: self.failure_status,
                    body: "boom".to_string(),
                });
            }
            Ok(format!("text of page {}", page.page_number))
        }
    }

    #[derive(Default)]
    struct RecordingProgress {
        events: Mutex<Vec<ProgressEvent>>,
    }

    impl ProgressSink for RecordingProgress {
        fn on_event(&self, event: ProgressEvent) {
            self.events.lock().expect("progress lock").push(event);
        }
    }

    fn config(workspace_root: PathBuf) -> ExtractionConfig {
        ExtractionConfig {
            retry: RetryPolicy::immediate(3),
            workspace_root: Some(workspace_root),
            ..ExtractionConfig::default()
        }
    }

    fn fake_pdf(dir: &Path) -> PathBuf {
        let path = dir.join("scan.pdf");
        std::fs::write(&path, b"%PDF-1.4 fake").expect("write fixture");
        path
    }

    #[tokio::test]
    async fn failed_page_gets_marker_and_run_continues() {
        let dir = tempdir().expect("tempdir");
        let workspace_root = dir.path().join("work");
        let source = fake_pdf(dir.path());
        let service = Arc::new(FakePageText::new(Some(2)));
        let rasterizer = Arc::new(FakeRasterizer::new(3));
        let extractor = Extractor::new(
            service.clone(),
            rasterizer.clone(),
            config(workspace_root.clone()),
        );
        let progress = RecordingProgress::default();

        let extracted = extractor
            .extract(&source, "doc-1", &progress, &CancellationToken::new())
            .await
            .expect("extraction should succeed");

        assert_eq!(extracted.page_count, 3);
        assert_eq!(extracted.failed_pages, vec![2]);
        assert!(extracted.text.contains(&page_marker(1, 3)));
        assert!(extracted.text.contains("text of page 1"));
        assert!(extracted.text.contains(&failed_page_marker(2)));
        assert!(extracted.text.contains("text of page 3"));
        // one call each for pages 1 and 3, three attempts for page 2
        assert_eq!(service.calls.load(Ordering::SeqCst), 5);
        assert_eq!(rasterizer.loads.load(Ordering::SeqCst), 1, "document is opened once");

        let events = progress.events.lock().expect("progress lock");
        let percents: Vec<f32> = events
            .iter()
            .filter_map(|event| match event {
                ProgressEvent::Extraction { progress, .. } => Some(progress.percent_complete),
                _ => None,
            })
            .collect();
        assert_eq!(percents.len(), 3);
        assert_eq!(percents.last().copied(), Some(100.0));

        let leftovers = std::fs::read_dir(&workspace_root)
            .expect("workspace root exists")
            .count();
        assert_eq!(leftovers, 0, "per-run workspace must be removed");
    }

    #[tokio::test]
    async fn rejected_page_is_marked_without_retrying() {
        let dir = tempdir().expect("tempdir");
        let source = fake_pdf(dir.path());
        let mut service = FakePageText::new(Some(1));
        service.failure_status = 400;
        let service = Arc::new(service);
        let extractor = Extractor::new(
            service.clone(),
            Arc::new(FakeRasterizer::new(2)),
            config(dir.path().join("work")),
        );

        let extracted = extractor
            .extract(&source, "doc-1", &crate::progress::NoopProgress, &CancellationToken::new())
            .await
            .expect("extraction should succeed");

        assert_eq!(extracted.failed_pages, vec![1]);
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancellation_is_observed_between_pages() {
        let dir = tempdir().expect("tempdir");
        let source = fake_pdf(dir.path());
        let token = CancellationToken::new();
        let mut service = FakePageText::new(None);
        service.cancel_after = Some((2, token.clone()));
        let service = Arc::new(service);
        let extractor = Extractor::new(
            service.clone(),
            Arc::new(FakeRasterizer::new(5)),
            config(dir.path().join("work")),
        );

        let error = extractor
            .extract(&source, "doc-1", &crate::progress::NoopProgress, &token)
            .await
            .expect_err("run must stop");

        assert!(error.is_cancelled());
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn plain_text_passes_through_with_full_progress() {
        let dir = tempdir().expect("tempdir");
        let source = dir.path().join("notes.txt");
        std::fs::write(&source, "Plain notes\n\nSecond paragraph").expect("write fixture");
        let extractor = Extractor::new(
            Arc::new(FakePageText::new(None)),
            Arc::new(FakeRasterizer::new(0)),
            config(dir.path().join("work")),
        );
        let progress = RecordingProgress::default();

        let extracted = extractor
            .extract(&source, "doc-2", &progress, &CancellationToken::new())
            .await
            .expect("plain text should pass through");

        assert_eq!(extracted.text, "Plain notes\n\nSecond paragraph");
        let events = progress.events.lock().expect("progress lock");
        assert!(matches!(
            events.as_slice(),
            [ProgressEvent::Extraction { progress, .. }] if progress.percent_complete == 100.0
        ));
    }

    #[test]
    fn unknown_sources_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let source = dir.path().join("photo.bin");
        std::fs::write(&source, b"\x89PNG").expect("write fixture");
        assert!(matches!(
            detect_source_kind(&source),
            Err(IngestError::UnsupportedSource(_))
        ));

        let disguised = dir.path().join("upload");
        std::fs::write(&disguised, b"%PDF-1.7").expect("write fixture");
        assert_eq!(detect_source_kind(&disguised).ok(), Some(SourceKind::Pdf));
    }
}
