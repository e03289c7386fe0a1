use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rate limited by {service}")]
    RateLimited {
        service: String,
        retry_after_secs: Option<u64>,
    },

    #[error("{service} returned {status}: {body}")]
    Status {
        service: String,
        status: u16,
        body: String,
    },

    #[error("invalid response from {service}: {details}")]
    InvalidResponse { service: String, details: String },

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

impl ServiceError {
    pub fn is_rate_limited(&self) -> bool {
        match self {
            ServiceError::RateLimited { .. } => true,
            ServiceError::Status { status, .. } => *status == 429,
            _ => false,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Http(error) => {
                error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
            }
            ServiceError::RateLimited { .. } => true,
            ServiceError::Status { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            ServiceError::InvalidResponse { .. } | ServiceError::Url(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    Duplicate(String),

    #[error("corrupt record {id}: {details}")]
    Corrupt { id: String, details: String },

    #[error("store lock poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("page {page} could not be rasterized: {details}")]
    Rasterize { page: usize, details: String },

    #[error("unsupported source: {0}")]
    UnsupportedSource(String),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("processing was cancelled")]
    Cancelled,

    #[error("embedding batch {batch} failed after {attempts} attempts: {source}")]
    EmbeddingFailed {
        batch: usize,
        attempts: u32,
        #[source]
        source: ServiceError,
    },

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding service returned {actual} vectors for {expected} inputs")]
    EmbeddingCount { expected: usize, actual: usize },

    #[error("embedding service returned out-of-range or duplicate index {0}")]
    EmbeddingIndex(usize),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("document {0} has no extracted text to reprocess")]
    MissingText(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("background task failed: {0}")]
    Task(String),
}

impl IngestError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, IngestError::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search request failed: {0}")]
    Request(String),

    #[error("query embedding failed: {0}")]
    Embedding(#[from] IngestError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("completion failed: {0}")]
    Completion(#[from] ServiceError),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
