use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use docchip_core::{
    discover_documents, AnswerGenerator, CharacterNgramEmbedder, ChatMessage, ChipSet, Classifier,
    CompletionService, Embedder, EmbeddingService, Extractor, IngestError, OfflineCompletion,
    OpenAiClient, OpenAiConfig, Orchestrator, PageTextService, PdfiumRasterizer, PipelineConfig,
    ProgressEvent, ProgressSink, Retriever, SqliteStore, StaticTemplates, TemplateProvider,
    TextLayerOnly,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "docchip", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// SQLite database holding documents and chunks.
    #[arg(long, env = "DOCCHIP_DATABASE", default_value = "docchip.sqlite3")]
    database: PathBuf,

    /// JSON file with document-type templates. Built-in templates otherwise.
    #[arg(long, env = "DOCCHIP_TEMPLATES")]
    templates: Option<PathBuf>,

    /// Use local deterministic services instead of an OpenAI-compatible API.
    #[arg(long, default_value_t = false)]
    offline: bool,

    #[command(flatten)]
    openai: OpenAiArgs,
}

#[derive(Args)]
struct OpenAiArgs {
    /// API key for the OpenAI-compatible endpoint.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    /// Base URL of the OpenAI-compatible endpoint.
    #[arg(long, env = "OPENAI_BASE_URL")]
    openai_base_url: Option<String>,

    /// Model used for classification and answers.
    #[arg(long, env = "DOCCHIP_CHAT_MODEL")]
    chat_model: Option<String>,

    /// Model used to transcribe page images.
    #[arg(long, env = "DOCCHIP_VISION_MODEL")]
    vision_model: Option<String>,

    /// Model used for chunk and query embeddings.
    #[arg(long, env = "DOCCHIP_EMBEDDING_MODEL")]
    embedding_model: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest files or a folder of documents.
    Ingest {
        /// Source file; repeat for several.
        #[arg(long = "file")]
        files: Vec<PathBuf>,
        /// Folder searched recursively for pdf, txt and md sources.
        #[arg(long)]
        folder: Option<PathBuf>,
    },
    /// Re-chunk and re-embed a document with custom chips.
    Reprocess {
        #[arg(long)]
        document_id: String,
        /// Custom chip as key=value; repeat for several.
        #[arg(long = "chip", value_parser = parse_chip)]
        chips: Vec<(String, String)>,
    },
    /// Cancel a document and remove everything written for it.
    Cancel {
        #[arg(long)]
        document_id: String,
    },
    /// Return the chunks most similar to a query.
    Retrieve {
        #[arg(long)]
        query: String,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        min_similarity: Option<f32>,
    },
    /// Answer a question from retrieved chunks.
    Ask {
        #[arg(long)]
        question: String,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        min_similarity: Option<f32>,
    },
    /// List stored documents, newest first.
    Documents,
}

struct Services {
    pages: Arc<dyn PageTextService>,
    completion: Arc<dyn CompletionService>,
    embeddings: Arc<dyn EmbeddingService>,
}

struct Pipeline {
    orchestrator: Arc<Orchestrator>,
    retriever: Arc<Retriever>,
    completion: Arc<dyn CompletionService>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        offline = cli.offline,
        "docchip boot"
    );

    let pipeline = build_pipeline(&cli).await?;

    match cli.command {
        Command::Ingest { files, folder } => {
            let mut sources = files;
            if let Some(folder) = folder {
                let discovered = discover_documents(&folder);
                if discovered.is_empty() {
                    warn!(folder = %folder.display(), "No ingestible documents found");
                }
                sources.extend(discovered);
            }
            if sources.is_empty() {
                bail!("nothing to ingest: pass --file or --folder");
            }

            let mut failures = 0usize;
            for source in sources {
                if !ingest_one(&pipeline.orchestrator, source).await? {
                    failures += 1;
                }
            }
            if failures > 0 {
                warn!(failures, "Some documents did not complete");
            }
        }
        Command::Reprocess { document_id, chips } => {
            let custom: ChipSet = chips.into_iter().collect();
            let outcome = pipeline
                .orchestrator
                .reprocess(&document_id, custom, &LogProgress)
                .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Cancel { document_id } => {
            let outcome = pipeline.orchestrator.cancel(&document_id).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Retrieve {
            query,
            top_k,
            min_similarity,
        } => {
            let hits = pipeline
                .retriever
                .retrieve(&query, top_k, min_similarity)
                .await?;
            if hits.is_empty() {
                println!("no chunks above the similarity floor");
            }
            for hit in hits {
                println!(
                    "score={:.4} document={} type={} chunk={} index={}",
                    hit.similarity,
                    hit.document_name,
                    hit.document_type.as_deref().unwrap_or("-"),
                    hit.chunk.chunk_id,
                    hit.chunk.chunk_index
                );
                println!("{}\n", hit.chunk.content().trim());
            }
        }
        Command::Ask {
            question,
            top_k,
            min_similarity,
        } => {
            let generator = AnswerGenerator::new(
                Arc::clone(&pipeline.retriever),
                Arc::clone(&pipeline.completion),
            );
            let history: Vec<ChatMessage> = Vec::new();
            let answer = generator
                .answer(&question, &history, top_k, min_similarity)
                .await?;
            println!("{}", answer.answer);
            for (position, source) in answer.sources.iter().enumerate() {
                println!(
                    "[{}] {} (similarity {:.2})",
                    position + 1,
                    source.document_name,
                    source.similarity
                );
            }
        }
        Command::Documents => {
            for document in pipeline.orchestrator.documents().await? {
                println!(
                    "{} {} status={} type={} chunks={} uploaded={}",
                    document.id,
                    document.file_name,
                    document.status,
                    document.document_type.as_deref().unwrap_or("-"),
                    document.chunk_count,
                    document.uploaded_at.to_rfc3339()
                );
                if let Some(message) = document.status_message.as_deref() {
                    println!("  message={message}");
                }
            }
        }
    }

    Ok(())
}

/// Runs one ingestion in the background; ctrl-c cancels it. Returns whether
/// the document completed.
async fn ingest_one(orchestrator: &Arc<Orchestrator>, source: PathBuf) -> anyhow::Result<bool> {
    let (sender, mut receiver) = mpsc::unbounded_channel::<ProgressEvent>();
    let reporter = tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            LogProgress.on_event(event);
        }
    });

    let started = orchestrator
        .start_ingest(source.clone(), Arc::new(sender))
        .await;
    let (document_id, mut handle) = match started {
        Ok(started) => started,
        Err(error) => {
            warn!(path = %source.display(), error = %error, "Skipped source");
            return Ok(false);
        }
    };

    let result = tokio::select! {
        joined = &mut handle => joined,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            warn!(document_id = %document_id, "Interrupt received, cancelling");
            let outcome = orchestrator.cancel(&document_id).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            handle.await
        }
    };
    let _ = reporter.await;

    match result.context("ingestion task panicked")? {
        Ok(outcome) => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(true)
        }
        Err(IngestError::Cancelled) => {
            println!("{document_id} cancelled");
            Ok(false)
        }
        Err(error) => {
            warn!(document_id = %document_id, path = %source.display(), error = %error, "Ingestion failed");
            Ok(false)
        }
    }
}

async fn build_pipeline(cli: &Cli) -> anyhow::Result<Pipeline> {
    let mut config = PipelineConfig::from_env().context("invalid DOCCHIP_* configuration")?;
    let services = if cli.offline {
        config.extraction.prefer_text_layer = true;
        Services {
            pages: Arc::new(TextLayerOnly),
            completion: Arc::new(OfflineCompletion),
            embeddings: Arc::new(CharacterNgramEmbedder::new(config.embedding.dimensions)),
        }
    } else {
        let openai = openai_config(&cli.openai)?;
        let client = Arc::new(OpenAiClient::new(openai)?);
        Services {
            pages: client.clone(),
            completion: client.clone(),
            embeddings: client,
        }
    };

    let store = Arc::new(
        SqliteStore::open(&cli.database)
            .with_context(|| format!("failed to open {}", cli.database.display()))?,
    );
    let templates: Arc<dyn TemplateProvider> = match &cli.templates {
        Some(path) => Arc::new(StaticTemplates::from_json_file(path)?),
        None => Arc::new(StaticTemplates::default()),
    };
    let loaded = templates.templates().await?;
    info!(
        database = %cli.database.display(),
        templates = loaded.len(),
        embedding = services.embeddings.name(),
        "Pipeline ready"
    );

    let rasterizer = Arc::new(PdfiumRasterizer::new(
        config.extraction.pdfium_library_path.clone(),
        config.extraction.max_render_pixels,
    ));
    let extractor = Extractor::new(services.pages, rasterizer, config.extraction.clone());
    let classifier = Classifier::new(Arc::clone(&services.completion), config.classification.clone());
    let embedder = Arc::new(Embedder::new(services.embeddings, config.embedding.clone()));
    let retriever = Arc::new(Retriever::new(
        Arc::clone(&embedder),
        store.clone(),
        config.retrieval,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        extractor,
        classifier,
        embedder,
        store,
        templates,
        config,
    ));

    Ok(Pipeline {
        orchestrator,
        retriever,
        completion: services.completion,
    })
}

fn openai_config(args: &OpenAiArgs) -> anyhow::Result<OpenAiConfig> {
    let config = OpenAiConfig::from_lookup(|key| {
        let flag = match key {
            "OPENAI_API_KEY" => args.openai_api_key.clone(),
            "OPENAI_BASE_URL" => args.openai_base_url.clone(),
            "DOCCHIP_CHAT_MODEL" => args.chat_model.clone(),
            "DOCCHIP_VISION_MODEL" => args.vision_model.clone(),
            "DOCCHIP_EMBEDDING_MODEL" => args.embedding_model.clone(),
            _ => None,
        };
        flag.or_else(|| std::env::var(key).ok())
    })
    .context("OpenAI settings are incomplete; pass --openai-api-key or use --offline")?;
    Ok(config)
}

fn parse_chip(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("chip key is empty in '{raw}'"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

/// Writes progress events to the log.
struct LogProgress;

impl ProgressSink for LogProgress {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Extraction {
                document_id,
                progress,
            } => info!(
                document_id = %document_id,
                page = progress.current_page,
                total = progress.total_pages,
                percent = progress.percent_complete,
                "Extraction progress"
            ),
            ProgressEvent::Embedding {
                document_id,
                embedded,
                total,
            } => info!(document_id = %document_id, embedded, total, "Embedding progress"),
            ProgressEvent::Status {
                document_id,
                status,
                message,
            } => info!(
                document_id = %document_id,
                status = %status,
                message = message.as_deref().unwrap_or(""),
                "Status changed"
            ),
            ProgressEvent::StageStarted { .. } | ProgressEvent::StageFinished { .. } => {}
        }
    }
}
