//! Job orchestration: parse → extract → generate → export → summary.
//!
//! A [`Pipeline`] owns the configuration, the extraction schema, the shared
//! [`CostTracker`], and (optionally) pre-built services. Each call to
//! [`Pipeline::run`] processes one [`JobRequest`] strictly stage by stage;
//! every stage's output is the next stage's whole input.
//!
//! Skipped stages take their output from the job's content file written by
//! an earlier run, so a run with `parse` and `extract` skipped regenerates
//! Q/A pairs from exactly the statements that run exported.
//!
//! Cancellation is cooperative and checked at stage boundaries only. Calls
//! already in flight finish (or time out) on their own.

use crate::config::{resolve_api_key, PipelineConfig};
use crate::cost::CostTracker;
use crate::error::{ConfigError, ExportError, ExtractionError, GenerationError, Pdf2QaError};
use crate::model::{Chunk, Document, QaPair, Statement};
use crate::pipeline::export::{ContentExporter, ContentFile, QaExporter};
use crate::pipeline::extract::Extractor;
use crate::pipeline::parse::Parser;
use crate::pipeline::qa::QaGenerator;
use crate::progress::{NoopProgressCallback, ProgressCallback, Stage};
use crate::schema::ExtractionSchema;
use crate::service::llamaparse::LlamaParseService;
use crate::service::llm::LlmChatService;
use crate::service::{ChatService, ParseService};
use crate::summary::{DocumentInfo, JobMetrics, JobSummary, SummaryGenerator};
use chrono::Utc;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Shared flag that asks a running job to stop at the next stage boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Stages to take from a previous run instead of executing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageSkips {
    pub parse: bool,
    pub extract: bool,
    pub qa: bool,
}

/// One document to process.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub document: Document,
    /// Namespaces output files and ledger records. Defaults to the file stem.
    pub job_id: Option<String>,
    pub skips: StageSkips,
}

impl JobRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            document: Document::new(path),
            job_id: None,
            skips: StageSkips::default(),
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_skips(mut self, skips: StageSkips) -> Self {
        self.skips = skips;
        self
    }

    pub fn job_id(&self) -> String {
        self.job_id
            .clone()
            .filter(|j| !j.trim().is_empty())
            .unwrap_or_else(|| self.document.default_job_id())
    }

    /// The job id, rejected when it could move output files out of their
    /// directory.
    pub fn checked_job_id(&self) -> Result<String, ConfigError> {
        let job_id = self.job_id();
        if job_id.contains(['/', '\\'])
            || job_id.contains("..")
            || job_id.chars().any(char::is_control)
        {
            return Err(ConfigError::Invalid(format!(
                "job id '{}' must not contain path separators, '..' or control characters",
                job_id.escape_debug()
            )));
        }
        Ok(job_id)
    }
}

/// Everything a successful run produced.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub summary: JobSummary,
    pub summary_path: PathBuf,
    pub chunks: Vec<Chunk>,
    pub statements: Vec<Statement>,
    pub pairs: Vec<QaPair>,
    pub extraction_failures: Vec<ExtractionError>,
    pub skipped_statements: Vec<GenerationError>,
}

/// Builder for [`Pipeline`]. Services left unset are created from the
/// configuration when a stage that needs them runs.
pub struct PipelineBuilder {
    config: PipelineConfig,
    parse_service: Option<Arc<dyn ParseService>>,
    extract_service: Option<Arc<dyn ChatService>>,
    qa_service: Option<Arc<dyn ChatService>>,
    costs: Option<Arc<CostTracker>>,
    progress: ProgressCallback,
    cancel: CancelFlag,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            parse_service: None,
            extract_service: None,
            qa_service: None,
            costs: None,
            progress: Arc::new(NoopProgressCallback),
            cancel: CancelFlag::default(),
        }
    }

    pub fn parse_service(mut self, service: Arc<dyn ParseService>) -> Self {
        self.parse_service = Some(service);
        self
    }

    pub fn extract_service(mut self, service: Arc<dyn ChatService>) -> Self {
        self.extract_service = Some(service);
        self
    }

    pub fn qa_service(mut self, service: Arc<dyn ChatService>) -> Self {
        self.qa_service = Some(service);
        self
    }

    /// Share an existing ledger instead of opening `costs.ledger_path`.
    pub fn costs(mut self, costs: Arc<CostTracker>) -> Self {
        self.costs = Some(costs);
        self
    }

    pub fn progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub fn cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Validate the configuration and load the extraction schema.
    pub fn build(self) -> Result<Pipeline, ConfigError> {
        self.config.validate()?;
        let schema = match &self.config.extractor.schema_path {
            Some(path) => ExtractionSchema::load(path)?,
            None => ExtractionSchema::default(),
        };
        let costs = self.costs.unwrap_or_else(|| {
            Arc::new(CostTracker::open(
                self.config.costs.ledger_path.clone(),
                self.config.costs.pricing.clone(),
            ))
        });
        Ok(Pipeline {
            config: self.config,
            schema,
            parse_service: self.parse_service,
            extract_service: self.extract_service,
            qa_service: self.qa_service,
            costs,
            progress: self.progress,
            cancel: self.cancel,
        })
    }
}

/// Services resolved for one run; `None` for skipped stages.
struct Services {
    parse: Option<Arc<dyn ParseService>>,
    extract: Option<Arc<dyn ChatService>>,
    qa: Option<Arc<dyn ChatService>>,
}

pub struct Pipeline {
    config: PipelineConfig,
    schema: ExtractionSchema,
    parse_service: Option<Arc<dyn ParseService>>,
    extract_service: Option<Arc<dyn ChatService>>,
    qa_service: Option<Arc<dyn ChatService>>,
    costs: Arc<CostTracker>,
    progress: ProgressCallback,
    cancel: CancelFlag,
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn costs(&self) -> &Arc<CostTracker> {
        &self.costs
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Run one job to completion.
    ///
    /// Per-item failures are counted in the summary and never fail the run
    /// unless `limits.max_failure_ratio` is set and exceeded. The cost
    /// ledger is flushed whether the run succeeds or not.
    pub async fn run(&self, request: &JobRequest) -> Result<JobReport, Pdf2QaError> {
        let job_id = request.checked_job_id()?;
        let services = self.resolve_services(request.skips)?;
        let result = self.run_stages(request, &job_id, services).await;
        if let Err(e) = self.costs.flush() {
            warn!("Could not flush cost ledger: {}", e);
        }
        if let Err(e) = &result {
            warn!("Job failed: {}", e);
        }
        result
    }

    /// Credentials and clients for every stage that will run, before any
    /// stage starts.
    fn resolve_services(&self, skips: StageSkips) -> Result<Services, ConfigError> {
        let parse = if skips.parse {
            None
        } else if let Some(s) = &self.parse_service {
            Some(s.clone())
        } else {
            let service: Arc<dyn ParseService> =
                Arc::new(LlamaParseService::from_config(&self.config.parser)?);
            Some(service)
        };

        let extract = if skips.extract {
            None
        } else if let Some(s) = &self.extract_service {
            Some(s.clone())
        } else {
            let c = &self.config.extractor;
            let key = resolve_api_key("extractor", &c.api_key_env)?;
            let service =
                LlmChatService::from_settings(c.provider.as_deref(), &c.model, Some(&key))?;
            let service: Arc<dyn ChatService> = Arc::new(service);
            Some(service)
        };

        let qa = if skips.qa {
            None
        } else if let Some(s) = &self.qa_service {
            Some(s.clone())
        } else {
            let c = &self.config.qa_generator;
            let key = resolve_api_key("qa_generator", &c.api_key_env)?;
            let service =
                LlmChatService::from_settings(c.provider.as_deref(), &c.model, Some(&key))?;
            let service: Arc<dyn ChatService> = Arc::new(service);
            Some(service)
        };

        Ok(Services { parse, extract, qa })
    }

    async fn run_stages(
        &self,
        request: &JobRequest,
        job_id: &str,
        services: Services,
    ) -> Result<JobReport, Pdf2QaError> {
        let document = &request.document;
        let skips = request.skips;
        let export = &self.config.export;
        let limits = &self.config.limits;
        let content = ContentExporter::new(export.content_path_for(job_id));
        let qa_file = QaExporter::new(export.qa_path_for(job_id), export.qa_format);

        info!("Starting job '{}' for {}", job_id, document.path.display());
        let mut metrics = JobMetrics::new(
            job_id,
            DocumentInfo {
                path: document.path.clone(),
                size_bytes: document.size_bytes(),
                pages: 0,
            },
        );
        metrics.prior_cost = self.costs.snapshot(Some(job_id)).total_cost();

        let mut previous = if skips.parse || skips.extract {
            Some(self.load_previous(&content, skips)?)
        } else {
            None
        };

        // ── Parse ────────────────────────────────────────────────────────
        self.checkpoint(Stage::Parse)?;
        let chunks = match (&services.parse, previous.as_mut()) {
            (Some(service), _) => {
                self.progress.on_stage_start(Stage::Parse, 1);
                self.progress.on_item_start(Stage::Parse, 0, 1);
                let started = Instant::now();
                let parser = Parser::new(service.clone(), self.costs.clone(), &self.config.parser)?;
                let outcome = match parser.parse(document, Some(job_id)).await {
                    Ok(o) => o,
                    Err(e) => {
                        self.progress.on_item_error(Stage::Parse, 0, 1, &e.to_string());
                        return Err(e.into());
                    }
                };
                self.progress.on_item_complete(Stage::Parse, 0, 1);
                self.progress.on_stage_complete(Stage::Parse, 1, 1);
                metrics.record_stage(Stage::Parse, started.elapsed().as_secs_f64());
                metrics.document.pages = outcome.pages;
                outcome.chunks
            }
            (None, Some(prev)) => {
                info!(
                    "Skipping parsing: reusing {} chunks from {}",
                    prev.chunks.len(),
                    content.path().display()
                );
                self.skip(&mut metrics, Stage::Parse);
                metrics.document.pages = distinct_pages(&prev.chunks);
                std::mem::take(&mut prev.chunks)
            }
            (None, None) => return Err(Pdf2QaError::Internal("parse service missing".into())),
        };
        metrics.counts.chunks = chunks.len();

        // ── Extract ──────────────────────────────────────────────────────
        self.checkpoint(Stage::Extract)?;
        let mut extraction_failures = Vec::new();
        let statements = match (&services.extract, previous.as_mut()) {
            (Some(service), _) => {
                let started = Instant::now();
                let extractor =
                    Extractor::new(service.clone(), self.costs.clone(), &self.config.extractor)
                        .with_progress(self.progress.clone());
                let outcome = extractor.extract(&chunks, &self.schema, Some(job_id)).await;
                metrics.record_stage(Stage::Extract, started.elapsed().as_secs_f64());
                metrics.failures.invalid_statements = outcome.invalid_items;
                metrics.failures.failed_chunks = outcome.failed_chunks.len();
                metrics.failures.extraction_failures = outcome.failure_count();
                if limits.exceeded(outcome.failed_chunks.len(), chunks.len()) {
                    return Err(threshold_error(
                        Stage::Extract,
                        outcome.failed_chunks.len(),
                        chunks.len(),
                        limits.max_failure_ratio,
                    ));
                }
                extraction_failures = outcome.failed_chunks;
                outcome.statements
            }
            (None, Some(prev)) => {
                if prev.statements.is_empty() && !skips.qa {
                    return Err(Pdf2QaError::MissingStageInput {
                        stage: Stage::Extract.name().to_string(),
                        detail: format!("{} holds no statements", content.path().display()),
                    });
                }
                info!("Skipping extraction: reusing {} statements", prev.statements.len());
                self.skip(&mut metrics, Stage::Extract);
                std::mem::take(&mut prev.statements)
            }
            (None, None) => return Err(Pdf2QaError::Internal("extract service missing".into())),
        };
        metrics.counts.statements = statements.len();

        // ── Generate ─────────────────────────────────────────────────────
        self.checkpoint(Stage::Generate)?;
        let mut skipped_statements = Vec::new();
        let pairs = match &services.qa {
            Some(service) => {
                let started = Instant::now();
                let source = document.path.display().to_string();
                let generator =
                    QaGenerator::new(service.clone(), self.costs.clone(), &self.config.qa_generator)
                        .with_progress(self.progress.clone());
                let outcome = generator.generate(&statements, &source, Some(job_id)).await;
                metrics.record_stage(Stage::Generate, started.elapsed().as_secs_f64());
                metrics.failures.skipped_statements = outcome.skipped.len();
                if limits.exceeded(outcome.skipped.len(), statements.len()) {
                    return Err(threshold_error(
                        Stage::Generate,
                        outcome.skipped.len(),
                        statements.len(),
                        limits.max_failure_ratio,
                    ));
                }
                skipped_statements = outcome.skipped;
                outcome.pairs
            }
            None => {
                self.skip(&mut metrics, Stage::Generate);
                Vec::new()
            }
        };
        metrics.counts.qa_pairs = pairs.len();

        // ── Export ───────────────────────────────────────────────────────
        self.checkpoint(Stage::Export)?;
        let files = if skips.qa { 1 } else { 2 };
        self.progress.on_stage_start(Stage::Export, files);
        let started = Instant::now();
        content.export(&chunks, &statements)?;
        metrics.add_output("content", content.path());
        if !skips.qa {
            qa_file.export(&pairs)?;
            metrics.add_output("qa", qa_file.path());
        }
        self.progress.on_stage_complete(Stage::Export, files, files);
        metrics.record_stage(Stage::Export, started.elapsed().as_secs_f64());

        // ── Summary ──────────────────────────────────────────────────────
        self.checkpoint(Stage::Summary)?;
        self.progress.on_stage_start(Stage::Summary, 1);
        metrics.finished_at = Utc::now();
        let summary_path = export.summary_path_for(job_id);
        let generator = SummaryGenerator::new(self.config.costs.decimals);
        let summary = generator.compose(&metrics, &self.costs.snapshot(Some(job_id)));
        generator.write(&summary, &summary_path)?;
        self.progress.on_stage_complete(Stage::Summary, 1, 1);

        info!(
            "Job '{}' complete: {} chunks, {} statements, {} Q/A pairs (skipped: {} of {} statements), cost ${:.4}",
            job_id,
            chunks.len(),
            statements.len(),
            pairs.len(),
            skipped_statements.len(),
            statements.len(),
            summary.costs.total_cost_usd
        );

        Ok(JobReport {
            summary,
            summary_path,
            chunks,
            statements,
            pairs,
            extraction_failures,
            skipped_statements,
        })
    }

    fn load_previous(
        &self,
        content: &ContentExporter,
        skips: StageSkips,
    ) -> Result<ContentFile, Pdf2QaError> {
        let stage = if skips.parse { Stage::Parse } else { Stage::Extract };
        let loaded = match content.load() {
            Ok(c) => c,
            Err(ExportError::ReadFailed { path, source }) => {
                return Err(Pdf2QaError::MissingStageInput {
                    stage: stage.name().to_string(),
                    detail: format!("cannot read previous output {}: {}", path.display(), source),
                })
            }
            Err(e) => return Err(e.into()),
        };
        if loaded.chunks.is_empty() {
            return Err(Pdf2QaError::MissingStageInput {
                stage: stage.name().to_string(),
                detail: format!("{} holds no chunks", content.path().display()),
            });
        }
        Ok(loaded)
    }

    fn skip(&self, metrics: &mut JobMetrics, stage: Stage) {
        metrics.record_skipped(stage);
        self.progress.on_stage_skipped(stage);
    }

    fn checkpoint(&self, stage: Stage) -> Result<(), Pdf2QaError> {
        if self.cancel.is_cancelled() {
            info!("Cancellation requested before {}", stage);
            return Err(Pdf2QaError::Cancelled {
                stage: stage.name().to_string(),
            });
        }
        Ok(())
    }
}

/// Pages covered by at least one chunk.
fn distinct_pages(chunks: &[Chunk]) -> u32 {
    let pages: BTreeSet<u32> = chunks.iter().flat_map(|c| c.pages.iter().copied()).collect();
    pages.len() as u32
}

fn threshold_error(
    stage: Stage,
    failed: usize,
    total: usize,
    max_ratio: Option<f64>,
) -> Pdf2QaError {
    Pdf2QaError::FailureThresholdExceeded {
        stage: stage.name().to_string(),
        failed,
        total,
        max_ratio: max_ratio.unwrap_or(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_defaults_to_file_stem() {
        assert_eq!(JobRequest::new("in/report.pdf").job_id(), "report");
        assert_eq!(JobRequest::new("in/report.pdf").with_job_id("run-7").job_id(), "run-7");
        assert_eq!(JobRequest::new("in/report.pdf").with_job_id("  ").job_id(), "report");
    }

    #[test]
    fn job_ids_that_escape_the_output_dir_are_rejected() {
        for bad in ["../../x", "a/b", "a\\b", "..", "run\n1"] {
            let request = JobRequest::new("in/report.pdf").with_job_id(bad);
            assert!(matches!(request.checked_job_id(), Err(ConfigError::Invalid(_))), "{bad:?}");
        }
        let request = JobRequest::new("in/report.pdf");
        assert_eq!(request.checked_job_id().unwrap(), "report");
        let request = request.with_job_id("run-7.v2");
        assert_eq!(request.checked_job_id().unwrap(), "run-7.v2");
    }

    #[test]
    fn reloaded_chunks_count_each_page_once() {
        let chunks = vec![
            Chunk::new("chunk-0000", "a", vec![1, 2]),
            Chunk::new("chunk-0001", "b", vec![2, 3]),
            Chunk::new("chunk-0002", "c", vec![5]),
        ];
        assert_eq!(distinct_pages(&chunks), 4);
        assert_eq!(distinct_pages(&[]), 0);
    }

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(!other.is_cancelled());
        flag.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn build_rejects_invalid_config() {
        let mut config = PipelineConfig::default();
        config.parser.chunk_overlap = config.parser.chunk_size;
        assert!(Pipeline::builder(config).build().is_err());
    }

    #[test]
    fn build_reports_bad_schema_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.extractor.schema_path = Some(dir.path().join("missing.json"));
        let err = Pipeline::builder(config).build().err().unwrap();
        assert!(matches!(err, ConfigError::Schema { .. }));
    }
}
