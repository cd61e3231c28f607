use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One structured finding as delivered by the extraction step. When
/// `source_document` is absent the batch-level source label is used.
#[derive(Debug, Clone, Deserialize)]
pub struct FindingRecord {
    #[serde(rename = "type")]
    pub record_type: String,
    pub content: String,
    #[serde(default)]
    pub source_document: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub finding_type: String,
    pub page: Option<u32>,
    pub segment: u32,
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub source_document: String,
    pub metadata: ChunkMetadata,
    pub vector: Vec<f32>,
}

// Persisted form of a chunk. Never mutated after insertion; a re-ingest of
// the same id replaces the whole record.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub text: String,
    pub source_document: String,
    pub metadata: ChunkMetadata,
    pub inserted_at: DateTime<Utc>,
    pub sequence: u64,
}

#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub record: VectorRecord,
    pub similarity: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    pub max_chunk_chars: usize,
    pub max_embed_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            max_chunk_chars: 2_000,
            max_embed_attempts: 3,
            retry_base_delay_ms: 250,
        }
    }
}
