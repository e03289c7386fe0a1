use super::{rank, Candidate};
use crate::error::StoreError;
use crate::models::{ChipChunk, ChipSet, DocumentStatus, RetrievedChunk, SourceDocument};
use crate::traits::{ChunkStore, DocumentStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    file_name TEXT NOT NULL,
    source_path TEXT NOT NULL,
    checksum TEXT NOT NULL,
    document_type TEXT,
    cleaned_text TEXT,
    status TEXT NOT NULL,
    status_message TEXT,
    uploaded_at TEXT NOT NULL,
    processed_at TEXT,
    auto_chips TEXT NOT NULL,
    custom_chips TEXT NOT NULL,
    chunk_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status);

CREATE TABLE IF NOT EXISTS chunks (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    chunk_id TEXT NOT NULL UNIQUE,
    document_id TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    word_count INTEGER NOT NULL,
    text TEXT NOT NULL,
    char_start INTEGER NOT NULL,
    char_end INTEGER NOT NULL,
    embedding BLOB,
    FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE,
    UNIQUE(document_id, chunk_index)
);

CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id);
"#;

const DOCUMENT_COLUMNS: &str = "id, file_name, source_path, checksum, document_type, cleaned_text, status, status_message, uploaded_at, processed_at, auto_chips, custom_chips, chunk_count";

const CHUNK_COLUMNS: &str =
    "c.seq, c.chunk_id, c.document_id, c.chunk_index, c.word_count, c.text, c.char_start, c.char_end, c.embedding";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

struct DocumentRow {
    id: String,
    file_name: String,
    source_path: String,
    checksum: String,
    document_type: Option<String>,
    cleaned_text: Option<String>,
    status: String,
    status_message: Option<String>,
    uploaded_at: String,
    processed_at: Option<String>,
    auto_chips: String,
    custom_chips: String,
    chunk_count: i64,
}

impl DocumentRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            file_name: row.get(1)?,
            source_path: row.get(2)?,
            checksum: row.get(3)?,
            document_type: row.get(4)?,
            cleaned_text: row.get(5)?,
            status: row.get(6)?,
            status_message: row.get(7)?,
            uploaded_at: row.get(8)?,
            processed_at: row.get(9)?,
            auto_chips: row.get(10)?,
            custom_chips: row.get(11)?,
            chunk_count: row.get(12)?,
        })
    }

    fn into_document(self) -> Result<SourceDocument, StoreError> {
        let status: DocumentStatus = self.status.parse().map_err(|details| StoreError::Corrupt {
            id: self.id.clone(),
            details,
        })?;
        let uploaded_at = parse_timestamp(&self.id, &self.uploaded_at)?;
        let processed_at = self
            .processed_at
            .as_deref()
            .map(|value| parse_timestamp(&self.id, value))
            .transpose()?;
        let auto_chips: ChipSet = serde_json::from_str(&self.auto_chips)?;
        let custom_chips: ChipSet = serde_json::from_str(&self.custom_chips)?;

        Ok(SourceDocument {
            id: self.id,
            file_name: self.file_name,
            source_path: self.source_path,
            checksum: self.checksum,
            document_type: self.document_type,
            cleaned_text: self.cleaned_text,
            status,
            status_message: self.status_message,
            uploaded_at,
            processed_at,
            auto_chips,
            custom_chips,
            chunk_count: self.chunk_count.max(0) as usize,
        })
    }
}

struct ChunkRow {
    seq: i64,
    chunk_id: String,
    document_id: String,
    chunk_index: i64,
    word_count: i64,
    text: String,
    char_start: i64,
    char_end: i64,
    embedding: Option<Vec<u8>>,
}

impl ChunkRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            chunk_id: row.get(1)?,
            document_id: row.get(2)?,
            chunk_index: row.get(3)?,
            word_count: row.get(4)?,
            text: row.get(5)?,
            char_start: row.get(6)?,
            char_end: row.get(7)?,
            embedding: row.get(8)?,
        })
    }

    fn into_chunk(self) -> Result<(u64, ChipChunk), StoreError> {
        let embedding = self
            .embedding
            .as_deref()
            .map(|bytes| decode_vector(&self.chunk_id, bytes))
            .transpose()?;
        Ok((
            self.seq.max(0) as u64,
            ChipChunk {
                chunk_id: self.chunk_id,
                document_id: self.document_id,
                chunk_index: self.chunk_index.max(0) as usize,
                word_count: self.word_count.max(0) as usize,
                text: self.text,
                char_start: self.char_start.max(0) as usize,
                char_end: self.char_end.max(0) as usize,
                embedding,
            },
        ))
    }
}

fn parse_timestamp(id: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|error| StoreError::Corrupt {
            id: id.to_string(),
            details: format!("bad timestamp '{value}': {error}"),
        })
}

pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|value| value.to_le_bytes()).collect()
}

pub fn decode_vector(id: &str, bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() % 4 != 0 {
        return Err(StoreError::Corrupt {
            id: id.to_string(),
            details: format!("embedding blob of {} bytes is not a multiple of 4", bytes.len()),
        });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|raw| f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        .collect())
}

fn insert_chunk_rows(conn: &Connection, chunks: &[ChipChunk]) -> Result<(), StoreError> {
    let mut statement = conn.prepare_cached(
        "INSERT INTO chunks (chunk_id, document_id, chunk_index, word_count, text, char_start, char_end, embedding)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for chunk in chunks {
        statement.execute(params![
            chunk.chunk_id,
            chunk.document_id,
            chunk.chunk_index as i64,
            chunk.word_count as i64,
            chunk.text,
            chunk.char_start as i64,
            chunk.char_end as i64,
            chunk.embedding.as_deref().map(encode_vector),
        ])?;
    }
    Ok(())
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn insert_document(&self, document: &SourceDocument) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO documents ({DOCUMENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                document.id,
                document.file_name,
                document.source_path,
                document.checksum,
                document.document_type,
                document.cleaned_text,
                document.status.as_str(),
                document.status_message,
                document.uploaded_at.to_rfc3339(),
                document.processed_at.map(|timestamp| timestamp.to_rfc3339()),
                serde_json::to_string(&document.auto_chips)?,
                serde_json::to_string(&document.custom_chips)?,
                document.chunk_count as i64,
            ],
        )
        .map_err(|error| match error {
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
            {
                StoreError::Duplicate(document.id.clone())
            }
            other => StoreError::from(other),
        })?;
        Ok(())
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<SourceDocument>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1"),
                params![document_id],
                DocumentRow::read,
            )
            .optional()?;
        row.map(DocumentRow::into_document).transpose()
    }

    async fn update_document(&self, document: &SourceDocument) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE documents SET file_name = ?2, source_path = ?3, checksum = ?4, document_type = ?5,
                cleaned_text = ?6, status = ?7, status_message = ?8, uploaded_at = ?9, processed_at = ?10,
                auto_chips = ?11, custom_chips = ?12, chunk_count = ?13
             WHERE id = ?1",
            params![
                document.id,
                document.file_name,
                document.source_path,
                document.checksum,
                document.document_type,
                document.cleaned_text,
                document.status.as_str(),
                document.status_message,
                document.uploaded_at.to_rfc3339(),
                document.processed_at.map(|timestamp| timestamp.to_rfc3339()),
                serde_json::to_string(&document.auto_chips)?,
                serde_json::to_string(&document.custom_chips)?,
                document.chunk_count as i64,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(document.id.clone()));
        }
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM documents WHERE id = ?1", params![document_id])?;
        Ok(deleted > 0)
    }

    async fn list_documents(&self) -> Result<Vec<SourceDocument>, StoreError> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents ORDER BY uploaded_at DESC, rowid DESC"
        ))?;
        let rows = statement
            .query_map([], DocumentRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(DocumentRow::into_document).collect()
    }
}

#[async_trait]
impl ChunkStore for SqliteStore {
    async fn insert_chunks(&self, chunks: &[ChipChunk]) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        insert_chunk_rows(&tx, chunks)?;
        tx.commit()?;
        debug!(chunks = chunks.len(), "Inserted chunks");
        Ok(())
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[ChipChunk]) -> Result<usize, StoreError> {
        if let Some(foreign) = chunks.iter().find(|chunk| chunk.document_id != document_id) {
            return Err(StoreError::Corrupt {
                id: foreign.chunk_id.clone(),
                details: format!("chunk belongs to {}, not {document_id}", foreign.document_id),
            });
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM documents WHERE id = ?1)",
            params![document_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(StoreError::NotFound(document_id.to_string()));
        }
        let removed = tx.execute("DELETE FROM chunks WHERE document_id = ?1", params![document_id])?;
        insert_chunk_rows(&tx, chunks)?;
        tx.commit()?;
        debug!(document_id, removed, inserted = chunks.len(), "Replaced chunks");
        Ok(removed)
    }

    async fn delete_chunks(&self, document_id: &str) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        Ok(conn.execute("DELETE FROM chunks WHERE document_id = ?1", params![document_id])?)
    }

    async fn count_chunks(&self, document_id: &str) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE document_id = ?1",
            params![document_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<ChipChunk>, StoreError> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks c WHERE c.document_id = ?1 ORDER BY c.chunk_index"
        ))?;
        let rows = statement
            .query_map(params![document_id], ChunkRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|row| row.into_chunk().map(|(_, chunk)| chunk))
            .collect()
    }

    async fn search_similar(
        &self,
        query: &[f32],
        min_similarity: f32,
        limit: usize,
    ) -> Result<Vec<RetrievedChunk>, StoreError> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {CHUNK_COLUMNS}, d.file_name, d.document_type
             FROM chunks c JOIN documents d ON d.id = c.document_id
             WHERE c.embedding IS NOT NULL
             ORDER BY c.seq"
        ))?;
        let rows = statement
            .query_map([], |row| {
                Ok((
                    ChunkRow::read(row)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, Option<String>>(10)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let candidates = rows
            .into_iter()
            .map(|(row, document_name, document_type)| {
                let (sequence, chunk) = row.into_chunk()?;
                Ok(Candidate {
                    sequence,
                    chunk,
                    document_name,
                    document_type,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(rank(query, candidates, min_similarity, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn chunk(document_id: &str, index: usize, vector: Vec<f32>) -> ChipChunk {
        ChipChunk {
            chunk_id: format!("{document_id}-{index}"),
            document_id: document_id.to_string(),
            chunk_index: index,
            word_count: 3,
            text: format!("[Content]\nchunk {index}"),
            char_start: index * 10,
            char_end: index * 10 + 7,
            embedding: Some(vector),
        }
    }

    fn document(id: &str) -> SourceDocument {
        let mut document = SourceDocument::pending(id, format!("{id}.pdf"), format!("/tmp/{id}.pdf"), "sum");
        document.document_type = Some("lease".to_string());
        document.auto_chips = [("tenant_name", "Acme")].into_iter().collect();
        document
    }

    #[tokio::test]
    async fn documents_round_trip_through_disk() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("docchip.db");
        {
            let store = SqliteStore::open(&path)?;
            let mut stored = document("doc-1");
            store.insert_document(&stored).await?;
            stored.status = DocumentStatus::Complete;
            stored.processed_at = Some(Utc::now());
            stored.cleaned_text = Some("Cleaned".to_string());
            store.update_document(&stored).await?;
        }

        let reopened = SqliteStore::open(&path)?;
        let loaded = reopened.get_document("doc-1").await?.expect("document persisted");
        assert_eq!(loaded.status, DocumentStatus::Complete);
        assert_eq!(loaded.auto_chips.get("tenant_name"), Some("Acme"));
        assert_eq!(loaded.cleaned_text.as_deref(), Some("Cleaned"));
        assert!(loaded.processed_at.is_some());
        assert_eq!(reopened.list_documents().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_document_id_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = SqliteStore::open(dir.path().join("docchip.db"))?;
        store.insert_document(&document("doc-1")).await?;

        let error = store
            .insert_document(&document("doc-1"))
            .await
            .expect_err("second insert must fail");
        assert!(matches!(error, StoreError::Duplicate(id) if id == "doc-1"));
        assert_eq!(store.list_documents().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn update_of_unknown_document_is_not_found() -> Result<(), StoreError> {
        let store = SqliteStore::in_memory()?;
        let error = store
            .update_document(&document("ghost"))
            .await
            .expect_err("unknown id must fail");
        assert!(matches!(error, StoreError::NotFound(_)));
        Ok(())
    }

    #[tokio::test]
    async fn vectors_and_cascade() -> Result<(), StoreError> {
        let store = SqliteStore::in_memory()?;
        store.insert_document(&document("doc-1")).await?;
        store
            .insert_chunks(&[chunk("doc-1", 0, vec![1.0, 0.0]), chunk("doc-1", 1, vec![0.0, 1.0])])
            .await?;

        let chunks = store.chunks_for_document("doc-1").await?;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].embedding.as_deref(), Some(&[0.0, 1.0][..]));
        assert_eq!(chunks[1].char_range(), 10..17);

        let hits = store.search_similar(&[1.0, 0.0], 0.5, 5).await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.chunk_index, 0);
        assert_eq!(hits[0].document_name, "doc-1.pdf");
        assert_eq!(hits[0].document_type.as_deref(), Some("lease"));

        assert!(store.delete_document("doc-1").await?);
        assert_eq!(store.count_chunks("doc-1").await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn replace_is_all_or_nothing() -> Result<(), StoreError> {
        let store = SqliteStore::in_memory()?;
        store.insert_document(&document("doc-1")).await?;
        let old: Vec<_> = (0..10).map(|index| chunk("doc-1", index, vec![1.0])).collect();
        store.insert_chunks(&old).await?;

        let mut duplicate = vec![chunk("doc-1", 0, vec![0.5]), chunk("doc-1", 0, vec![0.5])];
        duplicate[1].chunk_id = "other".to_string();
        assert!(store.replace_chunks("doc-1", &duplicate).await.is_err());
        assert_eq!(store.count_chunks("doc-1").await?, 10);

        let fresh: Vec<_> = (0..4)
            .map(|index| {
                let mut replacement = chunk("doc-1", index, vec![0.5]);
                replacement.chunk_id = format!("new-{index}");
                replacement
            })
            .collect();
        assert_eq!(store.replace_chunks("doc-1", &fresh).await?, 10);
        let ids: Vec<_> = store
            .chunks_for_document("doc-1")
            .await?
            .into_iter()
            .map(|chunk| chunk.chunk_id)
            .collect();
        assert_eq!(ids, vec!["new-0", "new-1", "new-2", "new-3"]);
        Ok(())
    }

    #[test]
    fn truncated_blob_is_corrupt() {
        assert_eq!(decode_vector("c", &encode_vector(&[1.5, -2.0])).ok(), Some(vec![1.5, -2.0]));
        assert!(matches!(
            decode_vector("c", &[0, 1, 2]),
            Err(StoreError::Corrupt { .. })
        ));
    }
}
