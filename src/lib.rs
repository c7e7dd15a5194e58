//! # edgequake-pdf2qa
//!
//! Turn documents into provenance-tagged chunks, extracted statements, and
//! question/answer pairs ready for language-model fine-tuning.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Parse     document-parsing service → pages → sliding-window chunks
//!  ├─ 2. Extract   one schema-constrained LLM call per chunk → statements
//!  ├─ 3. Generate  statement → question → answer, batched and paced
//!  ├─ 4. Export    content JSON + fine-tuning JSONL (atomic writes)
//!  └─ 5. Summary   timings, counts, failures and the job's costs
//! ```
//!
//! Every external call is priced and folded into a persisted
//! [`CostTracker`] ledger keyed by job, service and model.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdf2qa::{JobRequest, Pipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Needs LLAMA_CLOUD_API_KEY and OPENAI_API_KEY.
//!     let config = PipelineConfig::builder().output_dir("./output").build()?;
//!     let pipeline = Pipeline::builder(config).build()?;
//!     let report = pipeline.run(&JobRequest::new("report.pdf")).await?;
//!     println!("{} Q/A pairs, ${:.4}", report.pairs.len(), report.summary.costs.total_cost_usd);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2qa` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-pdf2qa = { version = "0.1", default-features = false }
//! ```
//!
//! ## Testing without services
//!
//! Every stage talks to the outside world through [`ParseService`] or
//! [`ChatService`]. Inject your own implementations with
//! [`PipelineBuilder::parse_service`], [`PipelineBuilder::extract_service`]
//! and [`PipelineBuilder::qa_service`].

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod cost;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod process;
pub mod progress;
pub mod prompts;
pub mod retry;
pub mod schema;
pub mod service;
pub mod summary;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    CostsConfig, ExportConfig, ExtractorConfig, LimitsConfig, ParserConfig, PipelineConfig,
    PipelineConfigBuilder, QaFormat, QaGeneratorConfig,
};
pub use cost::{
    ApiCall, Breakdown, Cost, CostRecord, CostSnapshot, CostTracker, ModelPrice, PriceTable,
};
pub use error::{
    ConfigError, ExportError, ExtractionError, GenerationError, ParsingError, Pdf2QaError,
    ServiceError,
};
pub use model::{Chunk, Document, QaMetadata, QaPair, Statement};
pub use process::{CancelFlag, JobReport, JobRequest, Pipeline, PipelineBuilder, StageSkips};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback, Stage};
pub use retry::RetryPolicy;
pub use schema::ExtractionSchema;
pub use service::{
    ChatReply, ChatRequest, ChatService, PageSpan, ParseService, ParsedDocument, RawSegment,
};
pub use summary::{JobSummary, SummaryGenerator};
