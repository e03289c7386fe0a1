use crate::chunking::ChunkingConfig;
use crate::cleaner::{CleaningOptions, PageMarkerMode, SpaceCollapse};
use crate::retry::RetryPolicy;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    #[error("Invalid value for environment variable {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub retry: RetryPolicy,
    /// Use the embedded text layer for pages that have one.
    pub prefer_text_layer: bool,
    pub min_text_layer_chars: usize,
    /// Parent directory for per-run page-image workspaces. System temp when unset.
    pub workspace_root: Option<PathBuf>,
    pub max_render_pixels: u32,
    pub pdfium_library_path: Option<PathBuf>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy {
                max_attempts: 3,
                ..RetryPolicy::default()
            },
            prefer_text_layer: false,
            min_text_layer_chars: 50,
            workspace_root: None,
            max_render_pixels: 2_000,
            pdfium_library_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationConfig {
    pub max_chars: usize,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self { max_chars: 8_000 }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub batch_size: usize,
    pub dimensions: usize,
    pub retry: RetryPolicy,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            batch_size: 96,
            dimensions: 1_536,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub min_similarity: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_similarity: 0.3,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub extraction: ExtractionConfig,
    pub cleaning: CleaningOptions,
    pub classification: ClassificationConfig,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();

        if let Some(value) = parse_var(&read, "DOCCHIP_PAGE_MAX_ATTEMPTS")? {
            config.extraction.retry.max_attempts = value;
        }
        if let Some(value) = parse_bool(&read, "DOCCHIP_PREFER_TEXT_LAYER")? {
            config.extraction.prefer_text_layer = value;
        }
        if let Some(value) = parse_var(&read, "DOCCHIP_MIN_TEXT_LAYER_CHARS")? {
            config.extraction.min_text_layer_chars = value;
        }
        if let Some(value) = read("DOCCHIP_WORKSPACE_DIR") {
            config.extraction.workspace_root = Some(PathBuf::from(value));
        }
        if let Some(value) = parse_var(&read, "DOCCHIP_MAX_RENDER_PIXELS")? {
            config.extraction.max_render_pixels = value;
        }
        if let Some(value) = read("PDFIUM_LIB_PATH") {
            config.extraction.pdfium_library_path = Some(PathBuf::from(value));
        }

        if let Some(value) = parse_bool(&read, "DOCCHIP_STRIP_STRUCTURAL_MARKERS")? {
            config.cleaning.strip_structural_markers = value;
        }
        if let Some(value) = parse_bool(&read, "DOCCHIP_AGGRESSIVE_SPACES")? {
            config.cleaning.space_collapse = if value {
                SpaceCollapse::Aggressive
            } else {
                SpaceCollapse::Conservative
            };
        }
        if let Some(value) = parse_bool(&read, "DOCCHIP_REMOVE_PAGE_MARKERS")? {
            config.cleaning.page_markers = if value {
                PageMarkerMode::Remove
            } else {
                PageMarkerMode::SectionBreak
            };
        }

        if let Some(value) = parse_var(&read, "DOCCHIP_CLASSIFY_MAX_CHARS")? {
            config.classification.max_chars = value;
        }

        if let Some(value) = parse_var(&read, "DOCCHIP_CHUNK_TARGET_WORDS")? {
            config.chunking.target_words = value;
        }
        if let Some(value) = parse_var(&read, "DOCCHIP_CHUNK_OVERLAP_WORDS")? {
            config.chunking.overlap_words = value;
        }
        if let Some(value) = parse_var(&read, "DOCCHIP_CHUNK_MIN_WORDS")? {
            config.chunking.min_words = value;
        }
        if let Some(value) = parse_bool(&read, "DOCCHIP_RESPECT_SECTIONS")? {
            config.chunking.respect_sections = value;
        }

        if let Some(value) = parse_var(&read, "DOCCHIP_EMBEDDING_BATCH_SIZE")? {
            config.embedding.batch_size = value;
        }
        if let Some(value) = parse_var(&read, "DOCCHIP_EMBEDDING_DIMENSIONS")? {
            config.embedding.dimensions = value;
        }
        if let Some(value) = parse_var(&read, "DOCCHIP_EMBEDDING_MAX_ATTEMPTS")? {
            config.embedding.retry.max_attempts = value;
        }

        if let Some(value) = parse_var(&read, "DOCCHIP_TOP_K")? {
            config.retrieval.top_k = value;
        }
        if let Some(value) = parse_var::<f32, _>(&read, "DOCCHIP_MIN_SIMILARITY")? {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    key: "DOCCHIP_MIN_SIMILARITY".to_string(),
                    value: value.to_string(),
                });
            }
            config.retrieval.min_similarity = value;
        }

        tracing::debug!(
            target_words = config.chunking.target_words,
            overlap_words = config.chunking.overlap_words,
            batch_size = config.embedding.batch_size,
            dimensions = config.embedding.dimensions,
            "Loaded pipeline configuration"
        );

        Ok(config)
    }
}

fn parse_var<T, F>(read: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    read(key)
        .map(|value| {
            value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            })
        })
        .transpose()
}

fn parse_bool<F>(read: &F, key: &str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    read(key)
        .map(|value| match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_overrides() {
        let config = PipelineConfig::from_lookup(lookup(&[])).expect("defaults should load");
        assert_eq!(config.chunking.target_words, 400);
        assert_eq!(config.chunking.overlap_words, 50);
        assert_eq!(config.embedding.batch_size, 96);
        assert_eq!(config.retrieval.top_k, 5);
        assert!(!config.extraction.prefer_text_layer);
    }

    #[test]
    fn overrides_are_applied() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("DOCCHIP_CHUNK_TARGET_WORDS", "250"),
            ("DOCCHIP_RESPECT_SECTIONS", "false"),
            ("DOCCHIP_AGGRESSIVE_SPACES", "yes"),
            ("DOCCHIP_MIN_SIMILARITY", "0.75"),
            ("DOCCHIP_WORKSPACE_DIR", "/var/tmp/docchip"),
        ]))
        .expect("overrides should load");

        assert_eq!(config.chunking.target_words, 250);
        assert!(!config.chunking.respect_sections);
        assert_eq!(config.cleaning.space_collapse, SpaceCollapse::Aggressive);
        assert_eq!(config.retrieval.min_similarity, 0.75);
        assert_eq!(
            config.extraction.workspace_root,
            Some(PathBuf::from("/var/tmp/docchip"))
        );
    }

    #[test]
    fn invalid_values_are_reported() {
        let error = PipelineConfig::from_lookup(lookup(&[("DOCCHIP_TOP_K", "many")]))
            .expect_err("non-numeric top_k must fail");
        assert_eq!(
            error,
            ConfigError::InvalidValue {
                key: "DOCCHIP_TOP_K".to_string(),
                value: "many".to_string(),
            }
        );

        assert!(PipelineConfig::from_lookup(lookup(&[("DOCCHIP_MIN_SIMILARITY", "1.5")])).is_err());
    }
}
