//! LlamaParse client: upload a document, poll the job, fetch per-page text.
//!
//! ```text
//! POST /api/v1/parsing/upload              → {"id": ...}
//! GET  /api/v1/parsing/job/{id}            → {"status": "PENDING" | "SUCCESS" | "ERROR"}
//! GET  /api/v1/parsing/job/{id}/result/json → {"pages": [{"page", "text", "md"}], "job_metadata"}
//! ```
//!
//! Each request is retried on its own, so a failed status poll never
//! uploads the document again or starts a second billed job.
//!
//! Page Markdown is preferred over plain text. Section labels come from the
//! most recent Markdown heading, carried forward across pages.

use super::{PageSpan, ParseService, ParsedDocument, RawSegment};
use crate::config::{resolve_api_key, ParserConfig};
use crate::error::{ConfigError, ServiceError};
use crate::pipeline::postprocess::clean_page_text;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info};

/// HTTP client for the LlamaParse cloud API.
pub struct LlamaParseService {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    split_by_page: bool,
    poll_interval: Duration,
    timeout: Duration,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct JobStatus {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct JobResult {
    #[serde(default)]
    pages: Vec<ResultPage>,
    #[serde(default)]
    job_metadata: Option<JobMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ResultPage {
    page: u32,
    #[serde(default)]
    text: String,
    #[serde(default)]
    md: String,
}

#[derive(Debug, Default, Deserialize)]
struct JobMetadata {
    #[serde(default)]
    job_pages: Option<u32>,
}

impl LlamaParseService {
    /// Build from the parser section, reading the key from `api_key_env`.
    pub fn from_config(config: &ParserConfig) -> Result<Self, ConfigError> {
        let api_key = resolve_api_key("parser", &config.api_key_env)?;
        Self::new(api_key, config)
    }

    pub fn new(api_key: impl Into<String>, config: &ParserConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            split_by_page: config.split_by_page,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            timeout: Duration::from_secs(config.timeout_secs),
            retry: config.retry_policy(),
        })
    }

    async fn upload(&self, path: &Path, language: &str) -> Result<String, ServiceError> {
        let job_id = self
            .retry
            .run("parse upload", || self.upload_once(path, language))
            .await
            .map_err(|e| e.last)?;
        info!("Uploaded {} as parsing job {}", path.display(), job_id);
        Ok(job_id)
    }

    async fn upload_once(&self, path: &Path, language: &str) -> Result<String, ServiceError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ServiceError::Rejected(format!("cannot read '{}': {e}", path.display())))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document.pdf".to_string());
        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime_for(path))?;
        let form = Form::new().part("file", part).text("language", language.to_string());

        let response = self
            .client
            .post(format!("{}/api/v1/parsing/upload", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;
        let upload: UploadResponse = check(response).await?.json().await?;
        Ok(upload.id)
    }

    async fn status(&self, job_id: &str) -> Result<JobStatus, ServiceError> {
        let response = self
            .client
            .get(format!("{}/api/v1/parsing/job/{job_id}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn wait_for(&self, job_id: &str) -> Result<(), ServiceError> {
        let started = Instant::now();
        loop {
            let status = self
                .retry
                .run("parse status", || self.status(job_id))
                .await
                .map_err(|e| e.last)?;
            match status.status.as_str() {
                "SUCCESS" => return Ok(()),
                "ERROR" | "CANCELED" | "CANCELLED" => {
                    return Err(ServiceError::Rejected(format!(
                        "parsing job {job_id} ended with {}: {}",
                        status.status,
                        status.error_message.unwrap_or_default()
                    )))
                }
                other => debug!("Parsing job {}: {}", job_id, other),
            }
            if started.elapsed() >= self.timeout {
                return Err(ServiceError::Timeout(format!(
                    "parsing job {job_id} not finished after {}s",
                    self.timeout.as_secs()
                )));
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn result(&self, job_id: &str) -> Result<JobResult, ServiceError> {
        let response = self
            .client
            .get(format!("{}/api/v1/parsing/job/{job_id}/result/json", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }
}

#[async_trait]
impl ParseService for LlamaParseService {
    fn model(&self) -> &str {
        "llamaparse"
    }

    fn retries_internally(&self) -> bool {
        true
    }

    async fn parse(&self, path: &Path, language: &str) -> Result<ParsedDocument, ServiceError> {
        let job_id = self.upload(path, language).await?;
        self.wait_for(&job_id).await?;
        let result = self
            .retry
            .run("parse result", || self.result(&job_id))
            .await
            .map_err(|e| e.last)?;

        let pages_billed = result
            .job_metadata
            .and_then(|m| m.job_pages)
            .unwrap_or(result.pages.len() as u32);
        Ok(ParsedDocument {
            segments: segments_from_pages(&result.pages, self.split_by_page),
            pages_billed,
        })
    }
}

/// Turn an HTTP error status into a classified [`ServiceError`].
async fn check(response: reqwest::Response) -> Result<reqwest::Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    match ServiceError::from_status(status.as_u16(), body) {
        ServiceError::RateLimited { .. } => Err(ServiceError::RateLimited { retry_after }),
        other => Err(other),
    }
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "doc" => "application/msword",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

static RE_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^#{1,6}[ \t]+(.+?)[ \t#]*$").unwrap());

/// Build raw segments from per-page results.
///
/// A page's section is its own first heading, else the last heading seen
/// on an earlier page. Blank pages are dropped. Without `split_by_page` all
/// pages become one segment joined by blank lines, with byte spans per page.
fn segments_from_pages(pages: &[ResultPage], split_by_page: bool) -> Vec<RawSegment> {
    let mut carried: Option<String> = None;
    let mut cleaned: Vec<(u32, String, Option<String>)> = Vec::with_capacity(pages.len());

    for p in pages {
        let source = if p.md.trim().is_empty() { &p.text } else { &p.md };
        let text = clean_page_text(source).trim().to_string();
        let headings: Vec<String> = RE_HEADING
            .captures_iter(&text)
            .map(|c| c[1].trim().to_string())
            .collect();
        let section = headings.first().cloned().or_else(|| carried.clone());
        if let Some(last) = headings.last() {
            carried = Some(last.clone());
        }
        if !text.is_empty() {
            cleaned.push((p.page, text, section));
        }
    }

    if split_by_page {
        return cleaned
            .into_iter()
            .map(|(page, text, section)| RawSegment {
                section,
                ..RawSegment::single_page(page, text)
            })
            .collect();
    }

    if cleaned.is_empty() {
        return Vec::new();
    }
    let mut joined = RawSegment {
        section: cleaned.iter().find_map(|(_, _, s)| s.clone()),
        ..RawSegment::default()
    };
    for (page, text, _) in cleaned {
        if !joined.text.is_empty() {
            joined.text.push_str("\n\n");
        }
        let start = joined.text.len();
        joined.text.push_str(&text);
        joined.spans.push(PageSpan {
            page,
            start,
            end: joined.text.len(),
        });
    }
    vec![joined]
}
