//! Seams to the external services a job depends on.
//!
//! Stages talk to the outside world only through these two traits, so the
//! pipeline can be driven end to end with in-process fakes:
//!
//! * [`ParseService`]: document bytes → page-attributed text segments
//!   ([`llamaparse::LlamaParseService`] in production).
//! * [`ChatService`]: one prompt → one completion with token usage
//!   ([`llm::LlmChatService`] over `edgequake-llm`).

pub mod llamaparse;
pub mod llm;

use crate::error::ServiceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Byte range `[start, end)` of a segment's text that came from `page`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSpan {
    pub page: u32,
    pub start: usize,
    pub end: usize,
}

/// One block of parsed text as returned by the parsing service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawSegment {
    pub text: String,
    /// Page offsets within `text`, ascending and non-overlapping.
    pub spans: Vec<PageSpan>,
    pub section: Option<String>,
}

impl RawSegment {
    /// A segment whose whole text comes from one page.
    pub fn single_page(page: u32, text: impl Into<String>) -> Self {
        let text = text.into();
        let end = text.len();
        Self {
            text,
            spans: vec![PageSpan { page, start: 0, end }],
            section: None,
        }
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }
}

/// Everything one parsing call produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedDocument {
    pub segments: Vec<RawSegment>,
    /// Pages the service bills for this call.
    pub pages_billed: u32,
}

/// External document-parsing service.
#[async_trait]
pub trait ParseService: Send + Sync {
    /// Model/tier name recorded in the cost ledger.
    fn model(&self) -> &str;

    /// True when `parse` retries its own requests. The caller then makes a
    /// single attempt, since repeating `parse` would start a new billed job.
    fn retries_internally(&self) -> bool {
        false
    }

    async fn parse(&self, path: &Path, language: &str) -> Result<ParsedDocument, ServiceError>;
}

/// A single-turn chat completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl ChatRequest {
    pub fn new(prompt: impl Into<String>, temperature: f32, max_tokens: usize) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            temperature,
            max_tokens,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatReply {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// External chat-completion service.
#[async_trait]
pub trait ChatService: Send + Sync {
    /// Model id used for pricing.
    fn model(&self) -> &str;

    async fn complete(&self, request: &ChatRequest) -> Result<ChatReply, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_page_span_covers_text() {
        let seg = RawSegment::single_page(7, "héllo").with_section("Intro");
        assert_eq!(seg.spans, vec![PageSpan { page: 7, start: 0, end: 6 }]);
        assert_eq!(seg.section.as_deref(), Some("Intro"));
    }

    #[test]
    fn chat_request_builder() {
        let req = ChatRequest::new("p", 0.0, 256).with_system("s");
        assert_eq!(req.system.as_deref(), Some("s"));
        assert_eq!(req.max_tokens, 256);
    }
}
