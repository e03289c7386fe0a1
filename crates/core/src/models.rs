use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

/// Marker placed between the metadata header and the content of a chunk.
pub const CONTENT_BOUNDARY: &str = "[Content]";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Complete,
    Error,
    Cancelled,
    Reprocessing,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Complete => "complete",
            DocumentStatus::Error => "error",
            DocumentStatus::Cancelled => "cancelled",
            DocumentStatus::Reprocessing => "reprocessing",
        }
    }

    /// A complete chunk set is persisted. Reprocessing swaps it in one step,
    /// so the previous set stays until then.
    pub fn has_persisted_chunks(&self) -> bool {
        matches!(self, DocumentStatus::Complete | DocumentStatus::Reprocessing)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(DocumentStatus::Pending),
            "processing" => Ok(DocumentStatus::Processing),
            "complete" => Ok(DocumentStatus::Complete),
            "error" => Ok(DocumentStatus::Error),
            "cancelled" => Ok(DocumentStatus::Cancelled),
            "reprocessing" => Ok(DocumentStatus::Reprocessing),
            other => Err(format!("unknown document status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chip {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ChipSet {
    entries: Vec<Chip>,
}

impl ChipSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|chip| chip.key == key) {
            Some(existing) => existing.value = value,
            None => self.entries.push(Chip { key, value }),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|chip| chip.key == key)
            .map(|chip| chip.value.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chip> {
        self.entries.iter()
    }

    pub fn non_empty(&self) -> impl Iterator<Item = &Chip> {
        self.entries
            .iter()
            .filter(|chip| !chip.value.trim().is_empty())
    }

    /// Auto chips overlaid with custom chips; custom wins on key collision.
    pub fn merged_with(&self, overrides: &ChipSet) -> ChipSet {
        let mut merged = self.clone();
        for chip in overrides.iter() {
            merged.insert(chip.key.clone(), chip.value.clone());
        }
        merged
    }
}

impl<K, V> FromIterator<(K, V)> for ChipSet
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut set = ChipSet::new();
        for (key, value) in iter {
            set.insert(key, value);
        }
        set
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceDocument {
    pub id: String,
    pub file_name: String,
    pub source_path: String,
    pub checksum: String,
    pub document_type: Option<String>,
    pub cleaned_text: Option<String>,
    pub status: DocumentStatus,
    pub status_message: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub auto_chips: ChipSet,
    pub custom_chips: ChipSet,
    pub chunk_count: usize,
}

impl SourceDocument {
    pub fn pending(
        id: impl Into<String>,
        file_name: impl Into<String>,
        source_path: impl Into<String>,
        checksum: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            file_name: file_name.into(),
            source_path: source_path.into(),
            checksum: checksum.into(),
            document_type: None,
            cleaned_text: None,
            status: DocumentStatus::Pending,
            status_message: None,
            uploaded_at: Utc::now(),
            processed_at: None,
            auto_chips: ChipSet::new(),
            custom_chips: ChipSet::new(),
            chunk_count: 0,
        }
    }

    pub fn effective_chips(&self) -> ChipSet {
        self.auto_chips.merged_with(&self.custom_chips)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChipChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub word_count: usize,
    pub text: String,
    /// Character offsets of the content slice within the cleaned text.
    pub char_start: usize,
    pub char_end: usize,
    pub embedding: Option<Vec<f32>>,
}

impl ChipChunk {
    pub fn char_range(&self) -> Range<usize> {
        self.char_start..self.char_end
    }

    /// The content slice without the metadata header. The boundary is matched
    /// as a whole line; chip lines always read `Label: value`.
    pub fn content(&self) -> &str {
        let marker = format!("\n{CONTENT_BOUNDARY}\n");
        match self.text.find(&marker) {
            Some(position) => &self.text[position + marker.len()..],
            None => &self.text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedChunk {
    pub chunk: ChipChunk,
    pub similarity: f32,
    pub document_name: String,
    pub document_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationResult {
    pub file_type: String,
    pub confidence: f32,
    pub chips: ChipSet,
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageTimings {
    pub extract_ms: u64,
    pub clean_ms: u64,
    pub classify_ms: u64,
    pub chunk_ms: u64,
    pub embed_ms: u64,
    pub store_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestOutcome {
    pub document_id: String,
    pub classification: ClassificationResult,
    pub chunk_count: usize,
    pub failed_pages: Vec<usize>,
    pub timings: StageTimings,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReprocessOutcome {
    pub previous_chunk_count: usize,
    pub new_chunk_count: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CancelOutcome {
    pub chunks_deleted: usize,
    pub document_deleted: bool,
    pub already_complete: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_chips_win_on_collision() {
        let auto: ChipSet = [("tenant_name", "Acme"), ("monthly_rent", "1200")]
            .into_iter()
            .collect();
        let custom: ChipSet = [("tenant_name", "Acme Holdings"), ("unit", "4B")]
            .into_iter()
            .collect();

        let merged = auto.merged_with(&custom);

        assert_eq!(merged.get("tenant_name"), Some("Acme Holdings"));
        assert_eq!(merged.get("monthly_rent"), Some("1200"));
        assert_eq!(merged.get("unit"), Some("4B"));
        let keys: Vec<_> = merged.iter().map(|chip| chip.key.as_str()).collect();
        assert_eq!(keys, vec!["tenant_name", "monthly_rent", "unit"]);
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            DocumentStatus::Pending,
            DocumentStatus::Processing,
            DocumentStatus::Complete,
            DocumentStatus::Error,
            DocumentStatus::Cancelled,
            DocumentStatus::Reprocessing,
        ] {
            assert_eq!(status.as_str().parse::<DocumentStatus>(), Ok(status));
        }
        assert!("done".parse::<DocumentStatus>().is_err());
    }

    #[test]
    fn content_strips_header() {
        let chunk = ChipChunk {
            chunk_id: "c".to_string(),
            document_id: "d".to_string(),
            chunk_index: 0,
            word_count: 2,
            text: format!("[Document Metadata]\nTenant Name: Acme\n{CONTENT_BOUNDARY}\nhello world"),
            char_start: 0,
            char_end: 11,
            embedding: None,
        };
        assert_eq!(chunk.content(), "hello world");
    }

    #[test]
    fn chip_value_mentioning_the_boundary_stays_in_the_header() {
        let chunk = ChipChunk {
            chunk_id: "c".to_string(),
            document_id: "d".to_string(),
            chunk_index: 0,
            word_count: 2,
            text: format!(
                "[Document Metadata]\nNotes: see {CONTENT_BOUNDARY}\n{CONTENT_BOUNDARY}\nhello {CONTENT_BOUNDARY}\nworld"
            ),
            char_start: 0,
            char_end: 21,
            embedding: None,
        };
        assert_eq!(chunk.content(), format!("hello {CONTENT_BOUNDARY}\nworld"));
    }
}
