//! Per-run records: the document, and the chunks, statements and Q/A pairs
//! derived from it.
//!
//! Every downstream record carries provenance back to its source text:
//!
//! ```text
//! Document ──▶ Chunk{id, pages, section} ──▶ Statement{chunk_id, pages} ──▶ QaPair{metadata}
//! ```
//!
//! Page numbers are 1-indexed as reported by the parsing service, kept
//! sorted ascending and free of duplicates.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File types the parsing service accepts.
pub const SUPPORTED_TYPES: &[&str] = &["pdf", "docx", "doc", "txt"];

/// The input of one pipeline run. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub path: PathBuf,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Document {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Lower-cased extension without the dot (`"pdf"`), or empty.
    pub fn file_type(&self) -> String {
        self.path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default()
    }

    pub fn is_supported(&self) -> bool {
        SUPPORTED_TYPES.contains(&self.file_type().as_str())
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Size on disk, or 0 when the file cannot be inspected.
    pub fn size_bytes(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    /// Default job identifier: the file stem (`report.pdf` → `report`).
    pub fn default_job_id(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "job".to_string())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A bounded span of parsed text with its page provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub pages: Vec<u32>,
    #[serde(default)]
    pub section: Option<String>,
}

impl Chunk {
    pub fn new(
        id: impl Into<String>,
        text: impl Into<String>,
        pages: impl IntoIterator<Item = u32>,
    ) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            pages: normalize_pages(pages),
            section: None,
        }
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }
}

/// An extracted factual unit derived from one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub id: String,
    pub text: String,
    pub pages: Vec<u32>,
    /// Id of the chunk this statement was extracted from.
    pub chunk_id: String,
    /// Schema fields other than the statement text and its pages.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

/// Provenance attached to every generated pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaMetadata {
    pub pages: Vec<u32>,
    pub source: String,
    pub chunk_id: String,
    pub statement_id: String,
}

/// A generated question/answer record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaPair {
    pub prompt: String,
    pub completion: String,
    pub metadata: QaMetadata,
}

impl QaPair {
    pub fn new(
        prompt: impl Into<String>,
        completion: impl Into<String>,
        statement: &Statement,
        source: &str,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            completion: completion.into(),
            metadata: QaMetadata {
                pages: statement.pages.clone(),
                source: source.to_string(),
                chunk_id: statement.chunk_id.clone(),
                statement_id: statement.id.clone(),
            },
        }
    }
}

/// Sort ascending and drop duplicates.
pub fn normalize_pages(pages: impl IntoIterator<Item = u32>) -> Vec<u32> {
    let mut v: Vec<u32> = pages.into_iter().collect();
    v.sort_unstable();
    v.dedup();
    v
}
