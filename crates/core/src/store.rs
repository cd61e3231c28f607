use crate::error::StoreError;
use crate::models::{Chunk, RetrievalResult, VectorRecord};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS records (
    id TEXT PRIMARY KEY,
    source_document TEXT NOT NULL,
    content TEXT NOT NULL,
    metadata TEXT NOT NULL,
    inserted_at TEXT NOT NULL,
    sequence INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS embeddings (
    record_id TEXT PRIMARY KEY,
    embedding BLOB NOT NULL,
    dimensions INTEGER NOT NULL
);
";

// Persistent opens hold SQLite's exclusive file lock for the lifetime of the
// handle, so a second writer on the same path fails fast instead of
// corrupting the backing file.
pub struct VectorStore {
    conn: Connection,
    dimensions: usize,
}

impl VectorStore {
    pub fn open(path: &Path, dimensions: usize) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "locking_mode", "EXCLUSIVE")?;
        conn.execute_batch("BEGIN EXCLUSIVE; COMMIT;")
            .map_err(|error| lock_error(error, path))?;

        Self::initialize(conn, dimensions)
    }

    pub fn open_in_memory(dimensions: usize) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn, dimensions)
    }

    fn initialize(conn: Connection, dimensions: usize) -> Result<Self, StoreError> {
        if dimensions == 0 {
            return Err(StoreError::InvalidArgument(
                "dimensions must be positive".to_string(),
            ));
        }

        conn.execute_batch(SCHEMA)?;

        let stored: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'dimensions'", [], |row| {
                row.get(0)
            })
            .optional()?;

        match stored {
            Some(value) => {
                let stored_dimensions = value.parse::<usize>().map_err(|_| {
                    StoreError::Corrupt(format!("unreadable dimensions entry: {value}"))
                })?;
                if stored_dimensions != dimensions {
                    return Err(StoreError::SchemaMismatch {
                        stored: stored_dimensions,
                        requested: dimensions,
                    });
                }
            }
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('dimensions', ?1)",
                    params![dimensions.to_string()],
                )?;
            }
        }

        Ok(Self { conn, dimensions })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Insert-or-replace keyed by the chunk's deterministic id.
    pub fn upsert(&mut self, chunk: &Chunk) -> Result<(), StoreError> {
        if chunk.vector.len() != self.dimensions {
            return Err(StoreError::InvalidArgument(format!(
                "vector dimension {} does not match store dimension {}",
                chunk.vector.len(),
                self.dimensions
            )));
        }

        let metadata = serde_json::to_string(&chunk.metadata)?;
        let normalized = l2_normalize(&chunk.vector);
        let blob: Vec<u8> = normalized
            .iter()
            .flat_map(|value| value.to_le_bytes())
            .collect();

        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM embeddings WHERE record_id = ?1",
            params![chunk.id],
        )?;
        tx.execute("DELETE FROM records WHERE id = ?1", params![chunk.id])?;

        let sequence: i64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM records",
            [],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO records (id, source_document, content, metadata, inserted_at, sequence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                chunk.id,
                chunk.source_document,
                chunk.text,
                metadata,
                Utc::now().to_rfc3339(),
                sequence,
            ],
        )?;
        tx.execute(
            "INSERT INTO embeddings (record_id, embedding, dimensions) VALUES (?1, ?2, ?3)",
            params![chunk.id, blob, self.dimensions as i64],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<bool, StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM embeddings WHERE record_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM records WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    /// Cosine search, highest similarity first, ties broken by insertion
    /// sequence (earliest first). Vectors are normalized on both sides.
    pub fn search(
        &self,
        query_vector: &[f32],
        k: usize,
    ) -> Result<Vec<RetrievalResult>, StoreError> {
        if k == 0 {
            return Err(StoreError::InvalidArgument(
                "k must be positive".to_string(),
            ));
        }
        if query_vector.len() != self.dimensions {
            return Err(StoreError::InvalidArgument(format!(
                "query vector dimension {} does not match store dimension {}",
                query_vector.len(),
                self.dimensions
            )));
        }

        let query = l2_normalize(query_vector);

        let mut statement = self.conn.prepare(
            "SELECT r.id, r.source_document, r.content, r.metadata, r.inserted_at, r.sequence, e.embedding
             FROM records r JOIN embeddings e ON e.record_id = r.id",
        )?;

        let rows = statement.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, Vec<u8>>(6)?,
            ))
        })?;

        let mut scored = Vec::new();
        for row in rows {
            let (id, source_document, content, metadata, inserted_at, sequence, blob) = row?;
            let vector = vector_from_blob(&blob);
            let similarity = dot(&query, &vector);

            scored.push(RetrievalResult {
                record: VectorRecord {
                    id,
                    source_document,
                    text: content,
                    metadata: serde_json::from_str(&metadata)?,
                    inserted_at: parse_timestamp(&inserted_at)?,
                    sequence: sequence as u64,
                },
                similarity,
            });
        }

        scored.sort_by(|left, right| {
            right
                .similarity
                .total_cmp(&left.similarity)
                .then(left.record.sequence.cmp(&right.record.sequence))
        });
        scored.truncate(k);

        Ok(scored)
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    // Dropping the store releases the connection and its file lock as well,
    // so every exit path unlocks.
    pub fn close(self) -> Result<(), StoreError> {
        self.conn
            .close()
            .map_err(|(_conn, error)| StoreError::Sqlite(error))
    }
}

fn lock_error(error: rusqlite::Error, path: &Path) -> StoreError {
    if let rusqlite::Error::SqliteFailure(inner, _) = &error {
        if inner.code == rusqlite::ErrorCode::DatabaseBusy
            || inner.code == rusqlite::ErrorCode::DatabaseLocked
        {
            return StoreError::Locked(path.display().to_string());
        }
    }
    StoreError::Sqlite(error)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| StoreError::Corrupt(format!("unreadable timestamp {raw}: {error}")))
}

fn vector_from_blob(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn dot(left: &[f32], right: &[f32]) -> f32 {
    left.iter().zip(right.iter()).map(|(a, b)| a * b).sum()
}

pub(crate) fn l2_normalize(vector: &[f32]) -> Vec<f32> {
    let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        vector.iter().map(|value| value / magnitude).collect()
    } else {
        vector.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;
    use tempfile::tempdir;

    fn chunk(id: &str, vector: Vec<f32>) -> Chunk {
        Chunk {
            id: id.to_string(),
            text: format!("text for {id}"),
            source_document: "paper.pdf".to_string(),
            metadata: ChunkMetadata {
                finding_type: "finding".to_string(),
                page: None,
                segment: 0,
            },
            vector,
        }
    }

    #[test]
    fn search_ranks_by_descending_similarity() -> Result<(), Box<dyn std::error::Error>> {
        let mut store = VectorStore::open_in_memory(3)?;
        store.upsert(&chunk("far", vec![0.0, 1.0, 0.0]))?;
        store.upsert(&chunk("near", vec![1.0, 0.0, 0.0]))?;
        store.upsert(&chunk("middle", vec![1.0, 1.0, 0.0]))?;

        let hits = store.search(&[1.0, 0.0, 0.0], 2)?;

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.id, "near");
        assert_eq!(hits[1].record.id, "middle");
        assert!(hits[0].similarity > hits[1].similarity);
        Ok(())
    }

    #[test]
    fn stored_magnitude_does_not_bias_ranking() -> Result<(), Box<dyn std::error::Error>> {
        let mut store = VectorStore::open_in_memory(2)?;
        store.upsert(&chunk("long", vec![100.0, 0.0]))?;
        store.upsert(&chunk("aligned", vec![0.0, 0.1]))?;

        let hits = store.search(&[0.0, 1.0], 2)?;

        assert_eq!(hits[0].record.id, "aligned");
        assert!((hits[0].similarity - 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn ties_break_by_insertion_order() -> Result<(), Box<dyn std::error::Error>> {
        let mut store = VectorStore::open_in_memory(2)?;
        store.upsert(&chunk("first", vec![1.0, 0.0]))?;
        store.upsert(&chunk("second", vec![1.0, 0.0]))?;

        let hits = store.search(&[1.0, 0.0], 2)?;

        assert_eq!(hits[0].record.id, "first");
        assert_eq!(hits[1].record.id, "second");
        Ok(())
    }

    #[test]
    fn zero_k_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let store = VectorStore::open_in_memory(2)?;
        let result = store.search(&[1.0, 0.0], 0);
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
        Ok(())
    }

    #[test]
    fn mismatched_query_dimension_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let store = VectorStore::open_in_memory(3)?;
        let result = store.search(&[1.0, 0.0], 1);
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
        Ok(())
    }

    #[test]
    fn empty_store_returns_no_hits() -> Result<(), Box<dyn std::error::Error>> {
        let store = VectorStore::open_in_memory(2)?;
        let hits = store.search(&[1.0, 0.0], 5)?;
        assert!(hits.is_empty());
        Ok(())
    }

    #[test]
    fn upsert_with_same_id_replaces_in_place() -> Result<(), Box<dyn std::error::Error>> {
        let mut store = VectorStore::open_in_memory(2)?;
        store.upsert(&chunk("a", vec![1.0, 0.0]))?;
        store.upsert(&chunk("a", vec![1.0, 0.0]))?;

        assert_eq!(store.len()?, 1);
        Ok(())
    }

    #[test]
    fn persistent_store_survives_reopen() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("findings.db");

        let mut store = VectorStore::open(&path, 2)?;
        store.upsert(&chunk("kept", vec![0.0, 1.0]))?;
        store.close()?;

        let reopened = VectorStore::open(&path, 2)?;
        let hits = reopened.search(&[0.0, 1.0], 1)?;

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, "kept");
        assert_eq!(hits[0].record.source_document, "paper.pdf");
        Ok(())
    }

    #[test]
    fn second_writer_fails_fast() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("findings.db");

        let _holder = VectorStore::open(&path, 2)?;
        let contender = VectorStore::open(&path, 2);

        assert!(matches!(contender, Err(StoreError::Locked(_))));
        Ok(())
    }

    #[test]
    fn reopen_with_other_dimensions_is_schema_mismatch() -> Result<(), Box<dyn std::error::Error>>
    {
        let dir = tempdir()?;
        let path = dir.path().join("findings.db");

        VectorStore::open(&path, 4)?.close()?;
        let result = VectorStore::open(&path, 8);

        assert!(matches!(
            result,
            Err(StoreError::SchemaMismatch {
                stored: 4,
                requested: 8
            })
        ));
        Ok(())
    }

    #[test]
    fn remove_deletes_the_record() -> Result<(), Box<dyn std::error::Error>> {
        let mut store = VectorStore::open_in_memory(2)?;
        store.upsert(&chunk("gone", vec![1.0, 0.0]))?;

        assert!(store.remove("gone")?);
        assert!(!store.remove("gone")?);
        assert!(store.is_empty()?);
        Ok(())
    }
}
