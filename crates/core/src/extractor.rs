use crate::error::IngestError;
use base64::{engine::general_purpose::STANDARD, Engine};
use lopdf::Document;
use reqwest::blocking::Client;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;
use walkdir::WalkDir;

pub const MAX_PDF_BYTES: u64 = 100 * 1024 * 1024;
pub const MIN_PDF_BYTES: u64 = 1024;

// Sent alongside each uploaded paper; the endpoint must answer with a single
// JSON document. `findings`, `relationships`, and `study.methods` are
// flattened into ingestable records.
pub const EXTRACTION_PROMPT: &str = "\
Extract structured information from this scientific paper. Answer with a single \
JSON object using this schema: {\"metadata\": {\"title\", \"authors\", \"year\", \
\"doi\"}, \"study\": {\"location\", \"objectives\", \"methods\": [{\"name\", \
\"type\", \"description\"}]}, \"findings\": [{\"statement\", \"type\", \"data\", \
\"evidence\", \"confidence\"}], \"relationships\": [{\"type\", \"description\", \
\"evidence\", \"strength\"}]}. Use null for unknown values, include only factual \
information from the paper, be precise with measurements and units, and do not \
wrap the JSON in code block markers.";

pub fn discover_source_files(folder: &Path, extension: &str) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let matches = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(extension));

        if matches {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

// Size and parse checks before a paper is shipped to the analysis endpoint.
pub fn validate_pdf(path: &Path) -> Result<(), IngestError> {
    let size = fs::metadata(path)?.len();

    if size > MAX_PDF_BYTES {
        return Err(IngestError::InvalidPdf(format!(
            "pdf too large for extraction ({size} bytes): {}",
            path.display()
        )));
    }
    if size < MIN_PDF_BYTES {
        return Err(IngestError::InvalidPdf(format!(
            "pdf too small to be valid: {}",
            path.display()
        )));
    }

    Document::load(path).map_err(|error| IngestError::InvalidPdf(error.to_string()))?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Option<Duration>,
}

impl ExtractionConfig {
    /// `EXTRACTION_ENDPOINT` is required; `EXTRACTION_API_KEY` and
    /// `EXTRACTION_MODEL` are optional.
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("EXTRACTION_ENDPOINT").ok()?;
        let endpoint = endpoint.trim().to_string();
        if endpoint.is_empty() {
            return None;
        }

        let api_key = std::env::var("EXTRACTION_API_KEY").ok().and_then(|value| {
            let key = value.trim().to_string();
            if key.is_empty() {
                None
            } else {
                Some(key)
            }
        });

        let model = std::env::var("EXTRACTION_MODEL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "document-analysis".to_string());

        Some(Self {
            endpoint,
            api_key,
            model,
            timeout: None,
        })
    }
}

pub struct ExtractionClient {
    endpoint: Url,
    api_key: Option<String>,
    model: String,
    client: Client,
}

impl ExtractionClient {
    pub fn new(config: ExtractionConfig) -> Result<Self, IngestError> {
        let endpoint = Url::parse(&config.endpoint)?;

        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;

        Ok(Self {
            endpoint,
            api_key: config.api_key,
            model: config.model,
            client,
        })
    }

    pub async fn extract_findings(&self, path: &Path) -> Result<Vec<Value>, IngestError> {
        tokio::task::block_in_place(|| self.extract_findings_blocking(path))
    }

    fn extract_findings_blocking(&self, path: &Path) -> Result<Vec<Value>, IngestError> {
        validate_pdf(path)?;

        let pdf = fs::read(path)?;
        let mut request = self.client.post(self.endpoint.clone()).json(&json!({
            "model": self.model,
            "prompt": EXTRACTION_PROMPT,
            "pdf_base64": STANDARD.encode(pdf),
            "source_path": path.to_string_lossy(),
        }));

        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send()?;

        if !response.status().is_success() {
            return Err(IngestError::ExtractionFailed(format!(
                "extraction request to {} returned {}",
                self.endpoint,
                response.status()
            )));
        }

        let payload: Value = response.json()?;
        let content = payload
            .pointer("/content")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                IngestError::ExtractionFailed(format!(
                    "extraction response carries no content for {}",
                    path.display()
                ))
            })?;

        let analysis: Value = serde_json::from_str(strip_code_fences(content))?;
        let records = flatten_analysis(&analysis, &path.to_string_lossy());

        if records.is_empty() {
            return Err(IngestError::ExtractionFailed(format!(
                "extraction produced no findings for {}",
                path.display()
            )));
        }

        Ok(records)
    }
}

// One record per line, the shape `read_finding_payloads` consumes.
pub fn write_findings_jsonl(path: &Path, records: &[Value]) -> Result<(), IngestError> {
    let mut lines = String::new();
    for record in records {
        lines.push_str(&serde_json::to_string(record)?);
        lines.push('\n');
    }
    fs::write(path, lines)?;
    Ok(())
}

// Models occasionally fence their JSON despite being told not to.
pub fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

/// One record per finding, relationship, and method, each tagged with its
/// type and source document.
pub fn flatten_analysis(analysis: &Value, source_document: &str) -> Vec<Value> {
    let mut records = Vec::new();

    for (pointer, record_type) in [
        ("/findings", "finding"),
        ("/relationships", "relationship"),
        ("/study/methods", "methodology"),
    ] {
        let Some(items) = analysis.pointer(pointer).and_then(Value::as_array) else {
            continue;
        };

        for item in items {
            let content = match item {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };

            records.push(json!({
                "type": record_type,
                "content": content,
                "source_document": source_document,
            }));
        }
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn analysis_flattens_into_typed_records() {
        let analysis = json!({
            "metadata": {"title": "Delta dynamics"},
            "study": {
                "methods": [{"name": "bathymetric survey", "type": "field"}]
            },
            "findings": [
                {"statement": "Gradients are flat", "confidence": "high"},
                {"statement": "Transport is seasonal", "confidence": "medium"}
            ],
            "relationships": [
                {"type": "causal", "description": "discharge drives transport"}
            ]
        });

        let records = flatten_analysis(&analysis, "delta.pdf");

        assert_eq!(records.len(), 4);
        assert_eq!(records[0]["type"], "finding");
        assert_eq!(records[2]["type"], "relationship");
        assert_eq!(records[3]["type"], "methodology");
        assert!(records
            .iter()
            .all(|record| record["source_document"] == "delta.pdf"));
        assert!(records[0]["content"]
            .as_str()
            .is_some_and(|content| content.contains("Gradients are flat")));
    }

    #[test]
    fn analysis_without_known_sections_flattens_to_nothing() {
        let records = flatten_analysis(&json!({"metadata": {}}), "x.pdf");
        assert!(records.is_empty());
    }

    #[test]
    fn undersized_pdf_fails_validation() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("tiny.pdf");
        fs::write(&path, b"%PDF-1.4")?;

        let result = validate_pdf(&path);
        assert!(matches!(result, Err(IngestError::InvalidPdf(_))));
        Ok(())
    }

    #[test]
    fn source_discovery_is_recursive_and_sorted() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let nested = dir.path().join("nested");
        fs::create_dir(&nested)?;

        File::create(dir.path().join("b.pdf")).and_then(|mut file| file.write_all(b"%PDF"))?;
        File::create(nested.join("a.pdf")).and_then(|mut file| file.write_all(b"%PDF"))?;
        File::create(dir.path().join("notes.txt")).and_then(|mut file| file.write_all(b"x"))?;

        let files = discover_source_files(dir.path(), "pdf");
        assert_eq!(files.len(), 2);
        assert!(files[0] < files[1]);
        Ok(())
    }

    #[test]
    fn checksum_is_reproducible() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("a.pdf");
        fs::write(&path, b"abc")?;

        let first = digest_file(&path)?;
        let second = digest_file(&path)?;
        assert_eq!(first, second);
        Ok(())
    }
}
