//! Q/A generation stage: statements → question/answer pairs.
//!
//! Each statement takes two calls: statement → question, then statement +
//! question → answer. Statements are submitted in batches of `batch_size`
//! with a pause between batches. Within a batch up to `concurrency`
//! statements run at once.
//!
//! Transient failures are retried per call. Rate limiting is handled per
//! batch: the rate-limited statements of a batch are re-submitted after an
//! exponential backoff, keeping any question already generated, until they
//! succeed or `max_batch_retries` runs out. A statement that still fails is
//! skipped and reported as a [`GenerationError`].

use crate::config::QaGeneratorConfig;
use crate::cost::CostTracker;
use crate::error::{GenerationError, ServiceError};
use crate::model::{QaPair, Statement};
use crate::pipeline::postprocess::clean_generated_text;
use crate::progress::{NoopProgressCallback, ProgressCallback, Stage};
use crate::prompts::{answer_prompt, question_prompt};
use crate::retry::{RetryExhausted, RetryPolicy};
use crate::service::{ChatReply, ChatRequest, ChatService};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Ledger service name for Q/A generation calls.
pub const QA_SERVICE: &str = "qa_generator";

/// Everything the generation stage produced.
#[derive(Debug, Clone, Default)]
pub struct QaOutcome {
    /// In statement order.
    pub pairs: Vec<QaPair>,
    /// Statements that produced no pair, in statement order.
    pub skipped: Vec<GenerationError>,
    /// Batches submitted, not counting rate-limit re-submissions.
    pub batches: usize,
    /// Rate-limit re-submissions across all batches.
    pub resubmissions: usize,
}

/// Why one statement did not yield a pair on this submission.
enum ItemFailure {
    /// Worth re-submitting after a pause. Keeps the question if it exists.
    RateLimited {
        question: Option<String>,
        retry_after: Option<Duration>,
    },
    Failed(GenerationError),
}

pub struct QaGenerator {
    service: Arc<dyn ChatService>,
    costs: Arc<CostTracker>,
    progress: ProgressCallback,
    temperature: f32,
    max_tokens: usize,
    batch_size: usize,
    concurrency: usize,
    batch_delay: Duration,
    retry: RetryPolicy,
    max_batch_retries: u32,
}

impl QaGenerator {
    pub fn new(
        service: Arc<dyn ChatService>,
        costs: Arc<CostTracker>,
        config: &QaGeneratorConfig,
    ) -> Self {
        Self {
            service,
            costs,
            progress: Arc::new(NoopProgressCallback),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            batch_size: config.batch_size.max(1),
            concurrency: config.concurrency.max(1),
            batch_delay: Duration::from_millis(config.batch_delay_ms),
            retry: config.retry_policy().retry_if(ServiceError::is_transient),
            max_batch_retries: config.max_batch_retries,
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    /// Replace the per-call policy. Rate limits are always left to the
    /// batch loop, whatever predicate `retry` carries.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry.retry_if(ServiceError::is_transient);
        self
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    /// Generate one pair per statement where possible.
    ///
    /// `source` identifies the document in each pair's metadata.
    pub async fn generate(
        &self,
        statements: &[Statement],
        source: &str,
        job_id: Option<&str>,
    ) -> QaOutcome {
        let total = statements.len();
        info!(
            "Generating Q/A pairs from {} statements in batches of {}",
            total, self.batch_size
        );
        self.progress.on_stage_start(Stage::Generate, total);

        let mut slots: Vec<Option<Result<QaPair, GenerationError>>> = vec![None; total];
        let mut outcome = QaOutcome::default();

        for (batch_no, start) in (0..total).step_by(self.batch_size).enumerate() {
            if batch_no > 0 && !self.batch_delay.is_zero() {
                sleep(self.batch_delay).await;
            }
            let end = (start + self.batch_size).min(total);
            outcome.batches += 1;
            debug!("Submitting batch {} (statements {}..{})", batch_no + 1, start, end);
            outcome.resubmissions += self
                .run_batch(statements, start..end, total, source, job_id, &mut slots)
                .await;
        }

        for slot in slots.into_iter().flatten() {
            match slot {
                Ok(pair) => outcome.pairs.push(pair),
                Err(e) => outcome.skipped.push(e),
            }
        }

        self.progress.on_stage_complete(Stage::Generate, outcome.pairs.len(), total);
        info!(
            "Generated {} Q/A pairs in {} batches (skipped: {} of {} statements)",
            outcome.pairs.len(),
            outcome.batches,
            outcome.skipped.len(),
            total
        );
        outcome
    }

    /// Run one batch to completion, re-submitting rate-limited statements.
    /// Returns the number of re-submissions.
    async fn run_batch(
        &self,
        statements: &[Statement],
        range: std::ops::Range<usize>,
        total: usize,
        source: &str,
        job_id: Option<&str>,
        slots: &mut [Option<Result<QaPair, GenerationError>>],
    ) -> usize {
        let mut pending: Vec<(usize, Option<String>)> = range.map(|i| (i, None)).collect();
        for &(index, _) in &pending {
            self.progress.on_item_start(Stage::Generate, index, total);
        }

        let mut round = 0u32;
        loop {
            let results: Vec<(usize, Result<QaPair, ItemFailure>)> = stream::iter(pending.drain(..))
                .map(|(index, question)| async move {
                    (index, self.generate_one(&statements[index], question, source, job_id).await)
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

            let mut hint = Duration::ZERO;
            for (index, result) in results {
                let done = match result {
                    Ok(pair) => Ok(pair),
                    Err(ItemFailure::Failed(e)) => Err(e),
                    Err(ItemFailure::RateLimited { question, retry_after })
                        if round < self.max_batch_retries =>
                    {
                        hint = hint.max(retry_after.unwrap_or_default());
                        pending.push((index, question));
                        continue;
                    }
                    Err(ItemFailure::RateLimited { question, .. }) => Err(rate_limit_exhausted(
                        &statements[index].id,
                        question.is_some(),
                        self.max_batch_retries,
                    )),
                };
                match &done {
                    Ok(_) => self.progress.on_item_complete(Stage::Generate, index, total),
                    Err(e) => {
                        warn!("Skipping statement: {}", e);
                        self.progress.on_item_error(Stage::Generate, index, total, &e.to_string());
                    }
                }
                slots[index] = Some(done);
            }

            if pending.is_empty() {
                return round as usize;
            }
            round += 1;
            let backoff = self.retry.delay_for(round).max(hint);
            warn!(
                "{} statements rate limited, re-submitting batch in {}ms ({}/{})",
                pending.len(),
                backoff.as_millis(),
                round,
                self.max_batch_retries
            );
            pending.sort_by_key(|(index, _)| *index);
            sleep(backoff).await;
        }
    }

    async fn generate_one(
        &self,
        statement: &Statement,
        question: Option<String>,
        source: &str,
        job_id: Option<&str>,
    ) -> Result<QaPair, ItemFailure> {
        let question = match question {
            Some(q) => q,
            None => {
                let label = format!("question {}", statement.id);
                let reply = self
                    .call(&label, question_prompt(&statement.text), job_id)
                    .await
                    .map_err(|e| {
                        classify(e, None, |detail| GenerationError::QuestionFailed {
                            statement_id: statement.id.clone(),
                            detail,
                        })
                    })?;
                let q = clean_generated_text(&reply.content, "Question");
                if q.is_empty() {
                    return Err(ItemFailure::Failed(GenerationError::EmptyResponse {
                        statement_id: statement.id.clone(),
                        part: "question".into(),
                    }));
                }
                q
            }
        };

        let label = format!("answer {}", statement.id);
        let reply = self
            .call(&label, answer_prompt(&statement.text, &question), job_id)
            .await
            .map_err(|e| {
                classify(e, Some(question.clone()), |detail| GenerationError::AnswerFailed {
                    statement_id: statement.id.clone(),
                    detail,
                })
            })?;
        let answer = clean_generated_text(&reply.content, "Answer");
        if answer.is_empty() {
            return Err(ItemFailure::Failed(GenerationError::EmptyResponse {
                statement_id: statement.id.clone(),
                part: "answer".into(),
            }));
        }

        Ok(QaPair::new(question, answer, statement, source))
    }

    /// One chat call with transient retries; records its cost on success.
    async fn call(
        &self,
        label: &str,
        prompt: String,
        job_id: Option<&str>,
    ) -> Result<ChatReply, RetryExhausted> {
        let request = ChatRequest::new(prompt, self.temperature, self.max_tokens);
        let reply = self.retry.run(label, || self.service.complete(&request)).await?;
        self.costs.record_tokens(
            job_id,
            QA_SERVICE,
            self.service.model(),
            reply.input_tokens,
            reply.output_tokens,
        );
        Ok(reply)
    }
}

fn classify(
    e: RetryExhausted,
    question: Option<String>,
    failed: impl FnOnce(String) -> GenerationError,
) -> ItemFailure {
    match e.last {
        ServiceError::RateLimited { retry_after } => {
            ItemFailure::RateLimited { question, retry_after }
        }
        last => ItemFailure::Failed(failed(format!("{} (after {} attempt(s))", last, e.attempts))),
    }
}

fn rate_limit_exhausted(
    statement_id: &str,
    had_question: bool,
    resubmissions: u32,
) -> GenerationError {
    let statement_id = statement_id.to_string();
    let detail = format!("still rate limited after {resubmissions} re-submission(s)");
    if had_question {
        GenerationError::AnswerFailed { statement_id, detail }
    } else {
        GenerationError::QuestionFailed { statement_id, detail }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::PriceTable;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn statement(i: usize) -> Statement {
        Statement {
            id: format!("s{i}"),
            text: format!("Fact number {i}."),
            pages: vec![i as u32 + 1],
            chunk_id: format!("c{i}"),
            attributes: BTreeMap::new(),
        }
    }

    /// Echoes the statement back; questions for later statements finish first.
    struct EchoChat {
        calls: AtomicUsize,
        /// Remaining rate-limit responses per statement marker.
        throttle: Mutex<HashMap<String, usize>>,
        fail_answers_for: Option<&'static str>,
    }

    impl EchoChat {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                throttle: Mutex::new(HashMap::new()),
                fail_answers_for: None,
            }
        }
    }

    fn fact_of(prompt: &str) -> String {
        prompt
            .lines()
            .find_map(|l| l.strip_prefix("Statement: "))
            .unwrap_or_default()
            .to_string()
    }

    #[async_trait]
    impl ChatService for EchoChat {
        fn model(&self) -> &str {
            "gpt-3.5-turbo"
        }

        async fn complete(&self, request: &ChatRequest) -> Result<ChatReply, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fact = fact_of(&request.prompt);
            let n: u64 = fact
                .trim_start_matches("Fact number ")
                .trim_end_matches('.')
                .parse()
                .unwrap_or(0);
            // Invert completion order relative to submission order.
            sleep(Duration::from_millis(20u64.saturating_sub(n * 3))).await;

            let is_answer = request.prompt.ends_with("Answer:");
            if let Some(remaining) = self.throttle.lock().unwrap().get_mut(&fact) {
                if *remaining > 0 && is_answer {
                    *remaining -= 1;
                    return Err(ServiceError::RateLimited { retry_after: None });
                }
            }
            if is_answer && self.fail_answers_for == Some(fact.as_str()) {
                return Err(ServiceError::Rejected("content policy".into()));
            }
            let content = if is_answer {
                format!("Answer: {fact}")
            } else {
                format!("Question: \"What is {fact}?\"")
            };
            Ok(ChatReply {
                content,
                input_tokens: 50,
                output_tokens: 10,
            })
        }
    }

    fn generator(chat: Arc<EchoChat>, batch_size: usize) -> (QaGenerator, Arc<CostTracker>) {
        let costs = Arc::new(CostTracker::in_memory(PriceTable::default()));
        let config = QaGeneratorConfig {
            batch_size,
            batch_delay_ms: 0,
            retry_backoff_ms: 1,
            ..QaGeneratorConfig::default()
        };
        (QaGenerator::new(chat, costs.clone(), &config), costs)
    }

    #[tokio::test]
    async fn five_statements_in_batches_of_two() {
        let chat = Arc::new(EchoChat::new());
        let (g, costs) = generator(chat.clone(), 2);
        let statements: Vec<Statement> = (0..5).map(statement).collect();
        let out = g.generate(&statements, "doc.pdf", Some("job")).await;

        assert_eq!(out.batches, 3);
        assert_eq!(out.pairs.len(), 5);
        assert!(out.skipped.is_empty());
        let ids: Vec<&str> = out.pairs.iter().map(|p| p.metadata.statement_id.as_str()).collect();
        assert_eq!(ids, vec!["s0", "s1", "s2", "s3", "s4"]);
        assert_eq!(out.pairs[2].prompt, "What is Fact number 2.?");
        assert_eq!(out.pairs[2].completion, "Fact number 2.");
        assert_eq!(out.pairs[2].metadata.pages, vec![3]);
        assert_eq!(out.pairs[2].metadata.source, "doc.pdf");
        assert_eq!(chat.calls.load(Ordering::SeqCst), 10);
        assert_eq!(costs.total_calls(), 10);
    }

    #[tokio::test]
    async fn rate_limited_answers_are_resubmitted_keeping_the_question() {
        let chat = Arc::new(EchoChat::new());
        chat.throttle.lock().unwrap().insert("Fact number 1.".into(), 2);
        let (g, _) = generator(chat.clone(), 3);
        let statements: Vec<Statement> = (0..3).map(statement).collect();
        let out = g.generate(&statements, "doc.pdf", None).await;

        assert_eq!(out.pairs.len(), 3);
        assert_eq!(out.resubmissions, 2);
        // 3 questions + 3 answers + 2 throttled answer attempts.
        assert_eq!(chat.calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn persistent_rate_limit_skips_the_statement() {
        let chat = Arc::new(EchoChat::new());
        chat.throttle.lock().unwrap().insert("Fact number 0.".into(), 100);
        let (g, _) = generator(chat, 2);
        let statements: Vec<Statement> = (0..2).map(statement).collect();
        let out = g.generate(&statements, "doc.pdf", None).await;

        assert_eq!(out.pairs.len(), 1);
        assert_eq!(out.pairs[0].metadata.statement_id, "s1");
        assert_eq!(out.skipped.len(), 1);
        assert!(matches!(
            out.skipped[0],
            GenerationError::AnswerFailed { ref statement_id, .. } if statement_id == "s0"
        ));
    }

    #[tokio::test]
    async fn rejected_answer_is_skipped_without_retry() {
        let mut chat = EchoChat::new();
        chat.fail_answers_for = Some("Fact number 2.");
        let chat = Arc::new(chat);
        let (g, _) = generator(chat.clone(), 5);
        let statements: Vec<Statement> = (0..3).map(statement).collect();
        let out = g.generate(&statements, "doc.pdf", None).await;

        assert_eq!(out.pairs.len(), 2);
        assert_eq!(out.skipped.len(), 1);
        assert_eq!(out.batches, 1);
        assert_eq!(chat.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn no_statements_no_batches() {
        let (g, _) = generator(Arc::new(EchoChat::new()), 5);
        let out = g.generate(&[], "doc.pdf", None).await;
        assert_eq!(out.batches, 0);
        assert!(out.pairs.is_empty());
    }
}
