use crate::embeddings::Embedder;
use crate::error::{EmbeddingError, IngestError, StoreError};
use crate::models::{Chunk, ChunkMetadata, FindingRecord, ProcessorOptions};
use crate::store::VectorStore;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use walkdir::WalkDir;

pub struct SkippedPayload {
    pub index: usize,
    pub reason: String,
}

pub struct FailedChunk {
    pub id: String,
    pub source_document: String,
    pub reason: String,
}

pub struct IngestReport {
    pub ingested: usize,
    pub skipped: Vec<SkippedPayload>,
    pub failed: Vec<FailedChunk>,
}

/// Deterministic chunk identity over `(source_document, text)`.
pub fn chunk_id(source_document: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_document.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Validate, segment, embed, and upsert a batch of extraction payloads.
/// Malformed payloads and chunks that exhaust the embedding retry budget are
/// recorded in the report, never aborting the batch; store failures propagate.
pub async fn process_batch<E: Embedder>(
    payloads: &[Value],
    store: &mut VectorStore,
    embedder: &E,
    source_label: &str,
    options: &ProcessorOptions,
) -> Result<IngestReport, StoreError> {
    let mut report = IngestReport {
        ingested: 0,
        skipped: Vec::new(),
        failed: Vec::new(),
    };

    for (index, payload) in payloads.iter().enumerate() {
        let record: FindingRecord = match serde_json::from_value(payload.clone()) {
            Ok(record) => record,
            Err(error) => {
                warn!(source = source_label, index, %error, "skipping malformed finding payload");
                report.skipped.push(SkippedPayload {
                    index,
                    reason: error.to_string(),
                });
                continue;
            }
        };

        let source_document = record
            .source_document
            .clone()
            .unwrap_or_else(|| source_label.to_string());

        for (segment, piece) in split_text(&record.content, options.max_chunk_chars)
            .into_iter()
            .enumerate()
        {
            let id = chunk_id(&source_document, &piece);

            let vector = match embed_with_retry(embedder, &piece, options).await {
                Ok(vector) => vector,
                Err(error) => {
                    warn!(source = %source_document, chunk = %id, %error, "embedding failed after retries, skipping chunk");
                    report.failed.push(FailedChunk {
                        id,
                        source_document: source_document.clone(),
                        reason: error.to_string(),
                    });
                    continue;
                }
            };

            store.upsert(&Chunk {
                id,
                text: piece,
                source_document: source_document.clone(),
                metadata: ChunkMetadata {
                    finding_type: record.record_type.clone(),
                    page: record.page,
                    segment: segment as u32,
                },
                vector,
            })?;
            report.ingested += 1;
        }
    }

    debug!(
        source = source_label,
        ingested = report.ingested,
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        "batch processed"
    );

    Ok(report)
}

async fn embed_with_retry<E: Embedder>(
    embedder: &E,
    text: &str,
    options: &ProcessorOptions,
) -> Result<Vec<f32>, EmbeddingError> {
    let mut delay = Duration::from_millis(options.retry_base_delay_ms);
    let mut attempt = 1u32;

    loop {
        match embedder.embed(text).await {
            Ok(vector) => return Ok(vector),
            Err(error) if attempt < options.max_embed_attempts => {
                warn!(attempt, %error, "embedding attempt failed, backing off");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

// Segments split at sentence boundaries; a single overlong sentence is
// hard-split.
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if max_chars == 0 || trimmed.chars().count() <= max_chars {
        return vec![trimmed.to_string()];
    }

    let mut segments = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    for sentence in split_sentences(trimmed) {
        let sentence_chars = sentence.chars().count();

        if sentence_chars > max_chars {
            if !current.is_empty() {
                segments.push(std::mem::take(&mut current));
                current_chars = 0;
            }
            let chars: Vec<char> = sentence.chars().collect();
            for window in chars.chunks(max_chars) {
                segments.push(window.iter().collect());
            }
            continue;
        }

        if !current.is_empty() && current_chars + sentence_chars + 1 > max_chars {
            segments.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        if !current.is_empty() {
            current.push(' ');
            current_chars += 1;
        }
        current.push_str(&sentence);
        current_chars += sentence_chars;
    }

    if !current.is_empty() {
        segments.push(current);
    }

    segments
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    for character in text.chars() {
        current.push(character);
        if matches!(character, '.' | '!' | '?' | '\n') {
            let sentence = current.trim().to_string();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            current.clear();
        }
    }

    let tail = current.trim().to_string();
    if !tail.is_empty() {
        sentences.push(tail);
    }

    sentences
}

/// One JSON payload per line; unparseable lines are skipped with a warning.
pub fn read_finding_payloads(path: &Path) -> Result<Vec<Value>, IngestError> {
    let raw = std::fs::read_to_string(path)?;
    let mut payloads = Vec::new();

    for (line_number, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(value) => payloads.push(value),
            Err(error) => {
                warn!(path = %path.display(), line = line_number + 1, %error, "skipping unparseable findings line");
            }
        }
    }

    Ok(payloads)
}

pub fn discover_finding_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_jsonl = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("jsonl"));

        if is_jsonl {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashEmbedder;
    use async_trait::async_trait;
    use serde_json::json;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct FlakyEmbedder {
        failures_remaining: Mutex<u32>,
        inner: HashEmbedder,
    }

    impl FlakyEmbedder {
        fn failing(times: u32) -> Self {
            Self {
                failures_remaining: Mutex::new(times),
                inner: HashEmbedder { dimensions: 8 },
            }
        }
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        fn dimensions(&self) -> usize {
            self.inner.dimensions
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            {
                let mut remaining = self.failures_remaining.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(EmbeddingError::Provider {
                        provider: "flaky".to_string(),
                        details: "transient outage".to_string(),
                    });
                }
            }
            self.inner.embed(text).await
        }
    }

    fn fast_options() -> ProcessorOptions {
        ProcessorOptions {
            retry_base_delay_ms: 1,
            ..ProcessorOptions::default()
        }
    }

    fn payload(content: &str) -> Value {
        json!({
            "type": "finding",
            "content": content,
            "source_document": "delta_study.pdf",
        })
    }

    #[test]
    fn chunk_ids_are_deterministic() {
        let first = chunk_id("paper.pdf", "rivers carry sediment");
        let second = chunk_id("paper.pdf", "rivers carry sediment");
        assert_eq!(first, second);

        let other_document = chunk_id("other.pdf", "rivers carry sediment");
        assert_ne!(first, other_document);
    }

    #[test]
    fn short_text_is_one_segment() {
        let segments = split_text("A short finding.", 100);
        assert_eq!(segments, vec!["A short finding.".to_string()]);
    }

    #[test]
    fn long_text_splits_at_sentence_boundaries() {
        let text = "First sentence here. Second sentence here. Third sentence here.";
        let segments = split_text(text, 45);

        assert!(segments.len() > 1);
        for segment in &segments {
            assert!(segment.chars().count() <= 45);
        }
    }

    #[test]
    fn overlong_sentence_is_hard_split() {
        let text = "x".repeat(50);
        let segments = split_text(&text, 20);
        assert_eq!(segments.len(), 3);
    }

    #[tokio::test]
    async fn malformed_payload_is_skipped_not_fatal() -> Result<(), Box<dyn std::error::Error>> {
        let embedder = HashEmbedder { dimensions: 8 };
        let mut store = VectorStore::open_in_memory(8)?;
        let payloads = vec![json!({"content": "missing type field"}), payload("valid finding.")];

        let report =
            process_batch(&payloads, &mut store, &embedder, "batch", &fast_options()).await?;

        assert_eq!(report.ingested, 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].index, 0);
        assert_eq!(store.len()?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn reingesting_a_batch_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
        let embedder = HashEmbedder { dimensions: 8 };
        let mut store = VectorStore::open_in_memory(8)?;
        let payloads = vec![payload("rivers transport sediment."), payload("deltas aggrade.")];

        process_batch(&payloads, &mut store, &embedder, "batch", &fast_options()).await?;
        let count_once = store.len()?;
        process_batch(&payloads, &mut store, &embedder, "batch", &fast_options()).await?;

        assert_eq!(store.len()?, count_once);
        Ok(())
    }

    #[tokio::test]
    async fn transient_embedding_failure_is_retried() -> Result<(), Box<dyn std::error::Error>> {
        let embedder = FlakyEmbedder::failing(2);
        let mut store = VectorStore::open_in_memory(8)?;

        let report = process_batch(
            &[payload("retried finding.")],
            &mut store,
            &embedder,
            "batch",
            &fast_options(),
        )
        .await?;

        assert_eq!(report.ingested, 1);
        assert!(report.failed.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_retries_skip_the_chunk_and_continue(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let embedder = FlakyEmbedder::failing(3);
        let mut store = VectorStore::open_in_memory(8)?;

        let report = process_batch(
            &[payload("doomed finding."), payload("surviving finding.")],
            &mut store,
            &embedder,
            "batch",
            &fast_options(),
        )
        .await?;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.ingested, 1);
        assert_eq!(store.len()?, 1);
        Ok(())
    }

    #[test]
    fn unparseable_jsonl_lines_are_skipped() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("findings.jsonl");
        fs::write(
            &path,
            "{\"type\":\"finding\",\"content\":\"ok\"}\nnot json at all\n\n{\"type\":\"finding\",\"content\":\"also ok\"}\n",
        )?;

        let payloads = read_finding_payloads(&path)?;
        assert_eq!(payloads.len(), 2);
        Ok(())
    }

    #[test]
    fn finding_file_discovery_is_recursive() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let nested = dir.path().join("nested");
        fs::create_dir(&nested)?;
        fs::write(dir.path().join("a.jsonl"), "{}\n")?;
        fs::write(nested.join("b.jsonl"), "{}\n")?;
        fs::write(dir.path().join("ignored.txt"), "x")?;

        let files = discover_finding_files(dir.path());
        assert_eq!(files.len(), 2);
        Ok(())
    }
}
