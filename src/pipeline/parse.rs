//! Parsing stage: document → ordered chunks.

use crate::config::ParserConfig;
use crate::cost::CostTracker;
use crate::error::{ConfigError, ParsingError};
use crate::model::{Chunk, Document};
use crate::pipeline::chunking::Chunker;
use crate::retry::RetryPolicy;
use crate::service::ParseService;
use std::sync::Arc;
use tracing::info;

/// Ledger service name for parsing calls.
pub const PARSER_SERVICE: &str = "parser";

/// Result of parsing one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOutcome {
    pub chunks: Vec<Chunk>,
    /// Pages the parsing service reported (and billed).
    pub pages: u32,
}

pub struct Parser {
    service: Arc<dyn ParseService>,
    costs: Arc<CostTracker>,
    chunker: Chunker,
    language: String,
    retry: RetryPolicy,
}

impl Parser {
    pub fn new(
        service: Arc<dyn ParseService>,
        costs: Arc<CostTracker>,
        config: &ParserConfig,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            service,
            costs,
            chunker: Chunker::new(config.chunk_size, config.chunk_overlap)?,
            language: config.language.clone(),
            retry: config.retry_policy(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Parse `document` and split it into chunks.
    ///
    /// Transient and rate-limit failures are retried; the last error is
    /// returned once attempts run out. A service that retries its own
    /// requests is called once. One ledger entry is recorded per successful
    /// call, priced per page.
    pub async fn parse(
        &self,
        document: &Document,
        job_id: Option<&str>,
    ) -> Result<ParseOutcome, ParsingError> {
        if !document.exists() {
            return Err(ParsingError::FileNotFound {
                path: document.path.clone(),
            });
        }
        if !document.is_supported() {
            return Err(ParsingError::UnsupportedType {
                path: document.path.clone(),
                file_type: document.file_type(),
            });
        }

        info!("Parsing document: {}", document.path.display());
        let retry = if self.service.retries_internally() {
            RetryPolicy::none()
        } else {
            self.retry
        };
        let parsed = retry
            .run("parse", || self.service.parse(&document.path, &self.language))
            .await
            .map_err(|e| ParsingError::Service {
                path: document.path.clone(),
                attempts: e.attempts,
                source: e.last,
            })?;

        self.costs.record_pages(
            job_id,
            PARSER_SERVICE,
            self.service.model(),
            u64::from(parsed.pages_billed),
        );

        let chunks = self.chunker.split(&parsed.segments);
        if chunks.is_empty() {
            return Err(ParsingError::EmptyDocument {
                path: document.path.clone(),
            });
        }
        info!(
            "Parsed {} pages into {} chunks ({} raw segments)",
            parsed.pages_billed,
            chunks.len(),
            parsed.segments.len()
        );
        Ok(ParseOutcome {
            chunks,
            pages: parsed.pages_billed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::{Cost, PriceTable};
    use crate::error::ServiceError;
    use crate::service::{ParsedDocument, RawSegment};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedParser {
        replies: Mutex<Vec<Result<ParsedDocument, ServiceError>>>,
        calls: Mutex<u32>,
        retries_internally: bool,
    }

    impl ScriptedParser {
        fn new(mut replies: Vec<Result<ParsedDocument, ServiceError>>) -> Arc<Self> {
            replies.reverse();
            Arc::new(Self {
                replies: Mutex::new(replies),
                calls: Mutex::new(0),
                retries_internally: false,
            })
        }

        fn self_retrying(mut replies: Vec<Result<ParsedDocument, ServiceError>>) -> Arc<Self> {
            replies.reverse();
            Arc::new(Self {
                replies: Mutex::new(replies),
                calls: Mutex::new(0),
                retries_internally: true,
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ParseService for ScriptedParser {
        fn model(&self) -> &str {
            "scripted"
        }

        fn retries_internally(&self) -> bool {
            self.retries_internally
        }

        async fn parse(
            &self,
            _path: &Path,
            _language: &str,
        ) -> Result<ParsedDocument, ServiceError> {
            *self.calls.lock().unwrap() += 1;
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(ServiceError::Rejected("no more replies".into())))
        }
    }

    fn one_page() -> ParsedDocument {
        ParsedDocument {
            segments: vec![RawSegment::single_page(
                1,
                "The mitochondria is the powerhouse of the cell.",
            )],
            pages_billed: 1,
        }
    }

    fn pdf_in(dir: &Path) -> PathBuf {
        let path = dir.join("cells.pdf");
        std::fs::write(&path, b"%PDF-1.4").unwrap();
        path
    }

    fn parser(service: Arc<ScriptedParser>, costs: Arc<CostTracker>) -> Parser {
        Parser::new(service, costs, &ParserConfig::default())
            .unwrap()
            .with_retry(RetryPolicy::new(3, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn retries_transient_failure_then_records_one_page() {
        let dir = tempfile::tempdir().unwrap();
        let service =
            ScriptedParser::new(vec![Err(ServiceError::Transient("502".into())), Ok(one_page())]);
        let costs = Arc::new(CostTracker::in_memory(PriceTable::default()));
        let outcome = parser(service.clone(), costs.clone())
            .parse(&Document::new(pdf_in(dir.path())), Some("cells"))
            .await
            .unwrap();

        assert_eq!(service.calls(), 2);
        assert_eq!(outcome.pages, 1);
        assert_eq!(outcome.chunks.len(), 1);
        assert_eq!(costs.total_calls(), 1);
        assert_eq!(costs.total_cost(), Cost::from_nanos(3_000_000));
    }

    #[tokio::test]
    async fn self_retrying_service_is_called_once() {
        let dir = tempfile::tempdir().unwrap();
        let service = ScriptedParser::self_retrying(vec![
            Err(ServiceError::Transient("status poll failed".into())),
            Ok(one_page()),
        ]);
        let costs = Arc::new(CostTracker::in_memory(PriceTable::default()));
        let err = parser(service.clone(), costs.clone())
            .parse(&Document::new(pdf_in(dir.path())), None)
            .await
            .unwrap_err();

        assert!(matches!(err, ParsingError::Service { attempts: 1, .. }));
        assert_eq!(service.calls(), 1);
        assert_eq!(costs.total_calls(), 0);
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let service = ScriptedParser::new(vec![Err(ServiceError::Auth("bad key".into()))]);
        let costs = Arc::new(CostTracker::in_memory(PriceTable::default()));
        let err = parser(service.clone(), costs.clone())
            .parse(&Document::new(pdf_in(dir.path())), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ParsingError::Service { attempts: 1, .. }));
        assert_eq!(service.calls(), 1);
        assert_eq!(costs.total_calls(), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_carry_last_error() {
        let dir = tempfile::tempdir().unwrap();
        let service = ScriptedParser::new(vec![
            Err(ServiceError::Timeout("1".into())),
            Err(ServiceError::Timeout("2".into())),
            Err(ServiceError::Timeout("3".into())),
        ]);
        let costs = Arc::new(CostTracker::in_memory(PriceTable::default()));
        let err = parser(service, costs)
            .parse(&Document::new(pdf_in(dir.path())), None)
            .await
            .unwrap_err();
        match err {
            ParsingError::Service { attempts, source, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(source, ServiceError::Timeout("3".into()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_and_unsupported_documents() {
        let dir = tempfile::tempdir().unwrap();
        let costs = Arc::new(CostTracker::in_memory(PriceTable::default()));
        let p = parser(ScriptedParser::new(vec![]), costs);

        let err = p.parse(&Document::new(dir.path().join("nope.pdf")), None).await.unwrap_err();
        assert!(matches!(err, ParsingError::FileNotFound { .. }));

        let pptx = dir.path().join("slides.pptx");
        std::fs::write(&pptx, b"x").unwrap();
        let err = p.parse(&Document::new(pptx), None).await.unwrap_err();
        assert!(matches!(
            err,
            ParsingError::UnsupportedType { ref file_type, .. } if file_type == "pptx"
        ));
    }

    #[tokio::test]
    async fn document_without_text_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let service = ScriptedParser::new(vec![Ok(ParsedDocument {
            segments: vec![RawSegment::single_page(1, "  ")],
            pages_billed: 1,
        })]);
        let costs = Arc::new(CostTracker::in_memory(PriceTable::default()));
        let err = parser(service, costs.clone())
            .parse(&Document::new(pdf_in(dir.path())), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ParsingError::EmptyDocument { .. }));
        // The call was still billed.
        assert_eq!(costs.total_calls(), 1);
    }
}
