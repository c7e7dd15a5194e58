//! Output files: content JSON, Q/A JSONL, and the atomic write under both.
//!
//! ## Content JSON
//!
//! One array, chunks first then statements, each entry tagged by `kind`:
//!
//! ```json
//! [
//!   {"kind": "chunk", "id": "chunk-0000", "text": "...", "pages": [1], "section": "Intro"},
//!   {"kind": "statement", "id": "chunk-0000-s00", "text": "...", "pages": [1], "chunk_id": "chunk-0000"}
//! ]
//! ```
//!
//! The same file is read back when a later run skips parsing or extraction.
//!
//! ## Q/A JSONL
//!
//! One record per line in generation order, either the chat fine-tuning
//! layout (`{"messages":[user, assistant]}`) or `{prompt, completion,
//! metadata}`; see [`QaFormat`].

use crate::config::QaFormat;
use crate::error::ExportError;
use crate::model::{Chunk, QaPair, Statement};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Replace `path` with `bytes` so readers see either the old file or the
/// complete new one.
///
/// The data goes to a temporary file in the same directory, is synced, and
/// is then renamed over `path`. Parent directories are created as needed.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ExportError> {
    let write_failed = |source| ExportError::WriteFailed {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(write_failed)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_failed)?;
    tmp.write_all(bytes).map_err(write_failed)?;
    tmp.as_file().sync_all().map_err(write_failed)?;
    tmp.persist(path).map_err(|e| write_failed(e.error))?;
    Ok(())
}

/// One entry of the content file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentEntry {
    Chunk(Chunk),
    Statement(Statement),
}

/// Chunks and statements read back from a content file, in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentFile {
    pub chunks: Vec<Chunk>,
    pub statements: Vec<Statement>,
}

/// Writes and reads the job's content JSON.
#[derive(Debug, Clone)]
pub struct ContentExporter {
    path: PathBuf,
}

impl ContentExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn export(&self, chunks: &[Chunk], statements: &[Statement]) -> Result<(), ExportError> {
        let entries: Vec<ContentEntry> = chunks
            .iter()
            .cloned()
            .map(ContentEntry::Chunk)
            .chain(statements.iter().cloned().map(ContentEntry::Statement))
            .collect();
        let json = serde_json::to_vec_pretty(&entries).map_err(|source| ExportError::Serialize {
            what: "content entries",
            source,
        })?;
        write_atomic(&self.path, &json)?;
        info!(
            "Exported {} chunks and {} statements to {}",
            chunks.len(),
            statements.len(),
            self.path.display()
        );
        Ok(())
    }

    pub fn load(&self) -> Result<ContentFile, ExportError> {
        let raw = std::fs::read(&self.path).map_err(|source| ExportError::ReadFailed {
            path: self.path.clone(),
            source,
        })?;
        let entries: Vec<ContentEntry> =
            serde_json::from_slice(&raw).map_err(|source| ExportError::Malformed {
                path: self.path.clone(),
                source,
            })?;
        let mut content = ContentFile::default();
        for entry in entries {
            match entry {
                ContentEntry::Chunk(c) => content.chunks.push(c),
                ContentEntry::Statement(s) => content.statements.push(s),
            }
        }
        Ok(content)
    }
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct MessagesRecord<'a> {
    messages: [Message<'a>; 2],
}

/// Writes Q/A pairs as JSON Lines.
#[derive(Debug, Clone)]
pub struct QaExporter {
    path: PathBuf,
    format: QaFormat,
}

impl QaExporter {
    pub fn new(path: impl Into<PathBuf>, format: QaFormat) -> Self {
        Self {
            path: path.into(),
            format,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialise one pair as a single JSON line (no trailing newline).
    pub fn render_line(&self, pair: &QaPair) -> Result<String, ExportError> {
        let line = match self.format {
            QaFormat::Messages => serde_json::to_string(&MessagesRecord {
                messages: [
                    Message {
                        role: "user",
                        content: &pair.prompt,
                    },
                    Message {
                        role: "assistant",
                        content: &pair.completion,
                    },
                ],
            }),
            QaFormat::PromptCompletion => serde_json::to_string(pair),
        };
        line.map_err(|source| ExportError::Serialize {
            what: "Q/A pair",
            source,
        })
    }

    /// Write all pairs, replacing any previous file. Returns the line count.
    pub fn export(&self, pairs: &[QaPair]) -> Result<usize, ExportError> {
        let mut out = String::new();
        for pair in pairs {
            out.push_str(&self.render_line(pair)?);
            out.push('\n');
        }
        write_atomic(&self.path, out.as_bytes())?;
        info!("Exported {} Q/A pairs to {}", pairs.len(), self.path.display());
        Ok(pairs.len())
    }
}
