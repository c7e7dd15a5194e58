//! Extraction stage: chunks → schema-validated statements.
//!
//! ## Page provenance
//!
//! A statement's pages are the union of what the model attributes to it
//! (`pages: [..]`, `page: n`, or `evidence: [{page: n}, ..]`), intersected
//! with its chunk's pages. When the model gives none, or only pages outside
//! the chunk, the statement inherits the whole chunk's pages.
//!
//! ## Failures
//!
//! Objects that fail schema validation are dropped with a warning and
//! counted. A chunk whose call fails (after retries) or whose reply holds no
//! JSON array yields an [`ExtractionError`] and no statements. Neither
//! stops the stage.

use crate::config::ExtractorConfig;
use crate::cost::CostTracker;
use crate::error::ExtractionError;
use crate::model::{normalize_pages, Chunk, Statement};
use crate::pipeline::postprocess::extract_json_array;
use crate::progress::{NoopProgressCallback, ProgressCallback, Stage};
use crate::prompts::{extraction_prompt, EXTRACTION_SYSTEM_PROMPT};
use crate::retry::RetryPolicy;
use crate::schema::ExtractionSchema;
use crate::service::{ChatRequest, ChatService};
use futures::stream::{self, StreamExt};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Ledger service name for extraction calls.
pub const EXTRACTOR_SERVICE: &str = "extractor";

/// Object keys that carry page provenance rather than attributes.
const PAGE_KEYS: &[&str] = &["page", "pages", "evidence"];

/// Everything the extraction stage produced.
#[derive(Debug, Clone, Default)]
pub struct ExtractionOutcome {
    /// In chunk order, then model order within a chunk.
    pub statements: Vec<Statement>,
    /// Objects dropped for violating the schema.
    pub invalid_items: usize,
    /// Chunks that yielded nothing because the call or reply failed.
    pub failed_chunks: Vec<ExtractionError>,
}

impl ExtractionOutcome {
    /// Dropped objects plus failed chunks.
    pub fn failure_count(&self) -> usize {
        self.invalid_items + self.failed_chunks.len()
    }
}

struct ChunkYield {
    statements: Vec<Statement>,
    invalid: usize,
}

type ChunkResult = Result<ChunkYield, ExtractionError>;

pub struct Extractor {
    service: Arc<dyn ChatService>,
    costs: Arc<CostTracker>,
    progress: ProgressCallback,
    temperature: f32,
    max_tokens: usize,
    concurrency: usize,
    retry: RetryPolicy,
}

impl Extractor {
    pub fn new(
        service: Arc<dyn ChatService>,
        costs: Arc<CostTracker>,
        config: &ExtractorConfig,
    ) -> Self {
        Self {
            service,
            costs,
            progress: Arc::new(NoopProgressCallback),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            concurrency: config.concurrency.max(1),
            retry: config.retry_policy(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Extract statements from every chunk.
    ///
    /// Up to `concurrency` chunks are in flight at once; results are put
    /// back in chunk order before they are returned.
    pub async fn extract(
        &self,
        chunks: &[Chunk],
        schema: &ExtractionSchema,
        job_id: Option<&str>,
    ) -> ExtractionOutcome {
        let total = chunks.len();
        info!("Extracting statements from {} chunks", total);
        self.progress.on_stage_start(Stage::Extract, total);

        let mut results: Vec<(usize, ChunkResult)> = stream::iter(chunks.iter().enumerate())
            .map(|(index, chunk)| async move {
                self.progress.on_item_start(Stage::Extract, index, total);
                let result = self.extract_chunk(chunk, schema, job_id).await;
                match &result {
                    Ok(_) => self.progress.on_item_complete(Stage::Extract, index, total),
                    Err(e) => {
                        self.progress.on_item_error(Stage::Extract, index, total, &e.to_string())
                    }
                }
                (index, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        results.sort_by_key(|(index, _)| *index);

        let mut outcome = ExtractionOutcome::default();
        for (_, result) in results {
            match result {
                Ok(y) => {
                    outcome.invalid_items += y.invalid;
                    outcome.statements.extend(y.statements);
                }
                Err(e) => {
                    warn!("{}", e);
                    outcome.failed_chunks.push(e);
                }
            }
        }

        let succeeded = total - outcome.failed_chunks.len();
        self.progress.on_stage_complete(Stage::Extract, succeeded, total);
        info!(
            "Extracted {} statements ({} invalid objects dropped, {} chunks failed)",
            outcome.statements.len(),
            outcome.invalid_items,
            outcome.failed_chunks.len()
        );
        outcome
    }

    async fn extract_chunk(
        &self,
        chunk: &Chunk,
        schema: &ExtractionSchema,
        job_id: Option<&str>,
    ) -> ChunkResult {
        let request = ChatRequest::new(
            extraction_prompt(&schema.prompt_json(), &chunk.text, &chunk.pages),
            self.temperature,
            self.max_tokens,
        )
        .with_system(EXTRACTION_SYSTEM_PROMPT);

        let label = format!("extract {}", chunk.id);
        let reply = self
            .retry
            .run(&label, || self.service.complete(&request))
            .await
            .map_err(|e| ExtractionError::CallFailed {
                chunk_id: chunk.id.clone(),
                detail: format!("{} (after {} attempt(s))", e.last, e.attempts),
            })?;

        self.costs.record_tokens(
            job_id,
            EXTRACTOR_SERVICE,
            self.service.model(),
            reply.input_tokens,
            reply.output_tokens,
        );

        let items =
            parse_items(&reply.content).map_err(|detail| ExtractionError::MalformedResponse {
                chunk_id: chunk.id.clone(),
                detail,
            })?;

        let mut statements = Vec::new();
        let mut invalid = 0;
        for item in &items {
            match schema.validate(item) {
                Ok(object) => {
                    let id = format!("{}-s{:02}", chunk.id, statements.len());
                    statements.push(build_statement(id, object, schema, chunk));
                }
                Err(violation) => {
                    invalid += 1;
                    warn!("Chunk {}: dropping extracted object: {}", chunk.id, violation);
                }
            }
        }
        debug!(
            "Chunk {}: {} statements, {} invalid",
            chunk.id,
            statements.len(),
            invalid
        );
        Ok(ChunkYield { statements, invalid })
    }
}

fn parse_items(reply: &str) -> Result<Vec<Value>, String> {
    let array = extract_json_array(reply).ok_or_else(|| {
        let preview: String = reply.chars().take(80).collect();
        format!("no JSON array in reply: {preview:?}")
    })?;
    serde_json::from_str::<Vec<Value>>(&array).map_err(|e| e.to_string())
}

fn build_statement(
    id: String,
    object: &Map<String, Value>,
    schema: &ExtractionSchema,
    chunk: &Chunk,
) -> Statement {
    let text = object
        .get(&schema.text_field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();

    let attributes: BTreeMap<String, Value> = object
        .iter()
        .filter(|(k, _)| **k != schema.text_field && !PAGE_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Statement {
        id,
        text,
        pages: statement_pages(object, &chunk.pages),
        chunk_id: chunk.id.clone(),
        attributes,
    }
}

/// Model-attributed pages restricted to the chunk, or the chunk's pages.
fn statement_pages(object: &Map<String, Value>, chunk_pages: &[u32]) -> Vec<u32> {
    let mut declared = Vec::new();
    if let Some(p) = object.get("page").and_then(as_page) {
        declared.push(p);
    }
    if let Some(list) = object.get("pages").and_then(Value::as_array) {
        declared.extend(list.iter().filter_map(as_page));
    }
    if let Some(evidence) = object.get("evidence").and_then(Value::as_array) {
        declared.extend(evidence.iter().filter_map(|e| e.get("page")).filter_map(as_page));
    }

    let within: Vec<u32> =
        normalize_pages(declared.into_iter().filter(|p| chunk_pages.contains(p)));
    if within.is_empty() {
        chunk_pages.to_vec()
    } else {
        within
    }
}

fn as_page(value: &Value) -> Option<u32> {
    value.as_u64().and_then(|n| u32::try_from(n).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::PriceTable;
    use crate::error::ServiceError;
    use crate::service::ChatReply;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    /// Replies per chunk, keyed by a marker found in the prompt text.
    struct KeyedChat {
        replies: Vec<(&'static str, Result<String, ServiceError>)>,
    }

    #[async_trait]
    impl ChatService for KeyedChat {
        fn model(&self) -> &str {
            "gpt-4o-mini"
        }

        async fn complete(&self, request: &ChatRequest) -> Result<ChatReply, ServiceError> {
            let (_, reply) = self
                .replies
                .iter()
                .find(|(marker, _)| request.prompt.contains(marker))
                .ok_or_else(|| ServiceError::Rejected("unexpected prompt".into()))?;
            reply.clone().map(|content| ChatReply {
                content,
                input_tokens: 100,
                output_tokens: 20,
            })
        }
    }

    type Replies = Vec<(&'static str, Result<String, ServiceError>)>;

    fn extractor(replies: Replies) -> (Extractor, Arc<CostTracker>) {
        let costs = Arc::new(CostTracker::in_memory(PriceTable::default()));
        let chat = Arc::new(KeyedChat { replies });
        let e = Extractor::new(chat, costs.clone(), &ExtractorConfig::default())
            .with_retry(RetryPolicy::new(2, Duration::from_millis(1)));
        (e, costs)
    }

    #[tokio::test]
    async fn invalid_objects_are_dropped_and_counted() {
        let (e, costs) = extractor(vec![
            ("ALPHA", Ok(r#"[{"statement": "Alpha is first.", "page": 1}, {"page": 1}]"#.into())),
            ("BETA", Ok(r#"```json
[{"statement": 42}, {"statement": "Beta is second."}]
```"#
                .into())),
        ]);
        let chunks = vec![
            Chunk::new("chunk-0000", "ALPHA text", [1]),
            Chunk::new("chunk-0001", "BETA text", [2, 3]),
        ];
        let out = e.extract(&chunks, &ExtractionSchema::default(), Some("job")).await;

        assert_eq!(out.statements.len(), 2);
        assert_eq!(out.invalid_items, 2);
        assert_eq!(out.failure_count(), 2);
        assert_eq!(out.statements[0].id, "chunk-0000-s00");
        assert_eq!(out.statements[0].pages, vec![1]);
        assert_eq!(out.statements[1].id, "chunk-0001-s00");
        assert_eq!(out.statements[1].pages, vec![2, 3]);
        assert_eq!(costs.total_calls(), 2);
    }

    #[tokio::test]
    async fn failed_chunk_does_not_stop_the_stage() {
        let (e, _) = extractor(vec![
            ("ALPHA", Err(ServiceError::Auth("revoked".into()))),
            ("BETA", Ok(r#"[{"statement": "Beta."}]"#.into())),
            ("GAMMA", Ok("Sorry, nothing to extract.".into())),
        ]);
        let chunks = vec![
            Chunk::new("c0", "ALPHA", [1]),
            Chunk::new("c1", "BETA", [2]),
            Chunk::new("c2", "GAMMA", [3]),
        ];
        let out = e.extract(&chunks, &ExtractionSchema::default(), None).await;
        assert_eq!(out.statements.len(), 1);
        assert_eq!(out.statements[0].chunk_id, "c1");
        assert_eq!(out.failed_chunks.len(), 2);
        assert!(matches!(
            out.failed_chunks[0],
            ExtractionError::CallFailed { ref chunk_id, .. } if chunk_id == "c0"
        ));
        assert!(matches!(out.failed_chunks[1], ExtractionError::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn output_follows_chunk_order() {
        let replies: Replies = ["K0", "K1", "K2", "K3", "K4", "K5"]
            .into_iter()
            .map(|k| (k, Ok(format!(r#"[{{"statement": "from {k}"}}]"#))))
            .collect();
        let (e, _) = extractor(replies);
        let chunks: Vec<Chunk> =
            (0..6).map(|i| Chunk::new(format!("c{i}"), format!("K{i}"), [1])).collect();
        let out = e.extract(&chunks, &ExtractionSchema::default(), None).await;
        let texts: Vec<&str> = out.statements.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["from K0", "from K1", "from K2", "from K3", "from K4", "from K5"]);
    }

    #[test]
    fn declared_pages_are_restricted_to_chunk() {
        let obj = json!({
            "statement": "s",
            "pages": [3, 9],
            "evidence": [{"page": 4}, {"page": "x"}]
        });
        assert_eq!(statement_pages(obj.as_object().unwrap(), &[3, 4, 5]), vec![3, 4]);

        let outside = json!({"statement": "s", "page": 12});
        assert_eq!(statement_pages(outside.as_object().unwrap(), &[3, 4]), vec![3, 4]);

        let none = json!({"statement": "s"});
        assert_eq!(statement_pages(none.as_object().unwrap(), &[7]), vec![7]);
    }

    #[test]
    fn extra_schema_fields_become_attributes() {
        let schema = ExtractionSchema::from_document(json!({
            "properties": {
                "statement": {"type": "string"},
                "confidence": {"type": "number"},
                "page": {"type": "integer"}
            },
            "required": ["statement"]
        }))
        .unwrap();
        let obj = json!({"statement": " Revenue grew. ", "confidence": 0.8, "page": 2});
        let chunk = Chunk::new("c", "t", [2]);
        let s = build_statement("c-s00".into(), obj.as_object().unwrap(), &schema, &chunk);
        assert_eq!(s.text, "Revenue grew.");
        assert_eq!(s.attributes.len(), 1);
        assert_eq!(s.attributes["confidence"], json!(0.8));
    }
}
