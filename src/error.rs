//! Error types for the edgequake-pdf2qa library.
//!
//! Failures fall into two families with different consequences:
//!
//! * **Fatal**: [`Pdf2QaError`] and the stage errors it wraps
//!   ([`ParsingError`], [`ExportError`], [`ConfigError`]). The job cannot
//!   produce trustworthy output and `Pipeline::run` returns `Err`.
//!
//! * **Per-item**: [`ExtractionError`] (one chunk) and [`GenerationError`]
//!   (one statement). The item is dropped, the error is recorded in the stage
//!   outcome and counted in the job summary, and the run continues.
//!
//! [`ServiceError`] sits underneath both: it classifies a single external
//! call failure so the retry policy can decide whether another attempt is
//! worth making.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// All fatal errors returned by the edgequake-pdf2qa library.
#[derive(Debug, Error)]
pub enum Pdf2QaError {
    /// Configuration was rejected before any stage ran.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The parsing stage failed; without chunks there is nothing downstream.
    #[error(transparent)]
    Parsing(#[from] ParsingError),

    /// An output file could not be written or read back.
    #[error(transparent)]
    Export(#[from] ExportError),

    /// Too many items failed in a stage for the configured tolerance.
    #[error("{stage} stage aborted: {failed}/{total} items failed (limit {limit:.0}%)", limit = .max_ratio * 100.0)]
    FailureThresholdExceeded {
        stage: String,
        failed: usize,
        total: usize,
        max_ratio: f64,
    },

    /// A skipped stage's output was expected on disk but is not there.
    #[error("Cannot skip the {stage} stage: {detail}")]
    MissingStageInput { stage: String, detail: String },

    /// The run was cancelled at a stage boundary.
    #[error("Job cancelled before the {stage} stage")]
    Cancelled { stage: String },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Fatal failure of the parsing stage.
#[derive(Debug, Error)]
pub enum ParsingError {
    /// Input file was not found at the given path.
    #[error("Document not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// The file extension is not one the parsing service accepts.
    #[error("Unsupported document type '{file_type}' for '{path}' (supported: pdf, docx, doc, txt)")]
    UnsupportedType { path: PathBuf, file_type: String },

    /// The parsing service kept failing; carries the last underlying error.
    #[error("Parsing '{path}' failed after {attempts} attempt(s): {source}")]
    Service {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: ServiceError,
    },

    /// The service answered but returned no text at all.
    #[error("Parsing service returned no text for '{path}'")]
    EmptyDocument { path: PathBuf },
}

/// Failure writing or reading one of the job's output files.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Could not create or write the output file.
    #[error("Failed to write output file '{path}': {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not read a previously written file.
    #[error("Failed to read '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file exists but does not hold what we expect.
    #[error("Malformed JSON in '{path}': {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Serialising an in-memory value failed.
    #[error("Failed to serialise {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Rejected configuration. Surfaces before any stage runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file missing or unreadable.
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid YAML.
    #[error("Invalid YAML in config file '{path}': {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Configuration file is not valid JSON.
    #[error("Invalid JSON in config file '{path}': {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A credential environment variable is unset or empty.
    #[error("Missing API key for {section}: set the {env_var} environment variable")]
    MissingApiKey { section: String, env_var: String },

    /// The LLM provider could not be constructed (unknown name, missing key).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// The extraction schema file is missing or malformed.
    #[error("Invalid extraction schema '{path}': {detail}")]
    Schema { path: PathBuf, detail: String },

    /// A value is out of range or inconsistent with another value.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// A non-fatal failure for one chunk during extraction.
///
/// The chunk contributes no statements; the run continues.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum ExtractionError {
    /// The extraction call failed after retries, or failed non-transiently.
    #[error("Chunk {chunk_id}: extraction call failed: {detail}")]
    CallFailed { chunk_id: String, detail: String },

    /// The service answered but the reply held no parseable JSON array.
    #[error("Chunk {chunk_id}: response was not a JSON array: {detail}")]
    MalformedResponse { chunk_id: String, detail: String },
}

/// A non-fatal failure for one statement during Q/A generation.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum GenerationError {
    /// The question call failed after retries.
    #[error("Statement {statement_id}: question generation failed: {detail}")]
    QuestionFailed { statement_id: String, detail: String },

    /// The answer call failed after retries.
    #[error("Statement {statement_id}: answer generation failed: {detail}")]
    AnswerFailed { statement_id: String, detail: String },

    /// The model returned an empty question or answer.
    #[error("Statement {statement_id}: model returned an empty {part}")]
    EmptyResponse { statement_id: String, part: String },
}

/// A single failed call to an external service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// HTTP 429 or provider-reported rate limiting.
    #[error("rate limited{}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    /// The call did not finish in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Network failure or 5xx.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Credentials rejected (401/403). Retrying will not help.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The request itself was rejected (4xx, malformed schema, job error).
    #[error("request rejected: {0}")]
    Rejected(String),
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(" (retry after {}s)", d.as_secs()))
        .unwrap_or_default()
}

impl ServiceError {
    /// Network blips, 5xx and timeouts. Rate limiting is excluded so call
    /// sites that pace whole batches can handle it themselves.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transient(_))
    }

    /// Any failure another attempt might fix.
    pub fn is_retryable(&self) -> bool {
        self.is_transient() || self.is_rate_limited()
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Classify an HTTP status from a service response.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            429 => Self::RateLimited { retry_after: None },
            401 | 403 => Self::Auth(format!("HTTP {status}: {body}")),
            408 | 504 => Self::Timeout(format!("HTTP {status}: {body}")),
            500..=599 => Self::Transient(format!("HTTP {status}: {body}")),
            _ => Self::Rejected(format!("HTTP {status}: {body}")),
        }
    }

    /// Classify a provider error that is only available as text.
    ///
    /// Chat providers surface HTTP failures as formatted messages, so the
    /// status has to be recovered from the wording. Unknown failures are
    /// treated as transient.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("429")
            || lower.contains("rate limit")
            || lower.contains("too many requests")
        {
            Self::RateLimited { retry_after: None }
        } else if lower.contains("401")
            || lower.contains("403")
            || lower.contains("unauthorized")
            || lower.contains("invalid api key")
            || lower.contains("authentication")
        {
            Self::Auth(message)
        } else if lower.contains("timed out") || lower.contains("timeout") {
            Self::Timeout(message)
        } else if lower.contains("400")
            || lower.contains("bad request")
            || lower.contains("invalid request")
        {
            Self::Rejected(message)
        } else {
            Self::Transient(message)
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if let Some(status) = e.status() {
            Self::from_status(status.as_u16(), e.to_string())
        } else if e.is_decode() {
            Self::Rejected(e.to_string())
        } else {
            Self::Transient(e.to_string())
        }
    }
}
