//! Configuration for a PDF-to-Q/A job.
//!
//! Every knob lives in [`PipelineConfig`], split into one section per stage
//! plus `costs` and `limits`. All fields have defaults, so a config file only
//! needs the values it changes:
//!
//! ```yaml
//! parser:
//!   chunk_size: 1200
//! qa_generator:
//!   model: gpt-4o-mini
//!   batch_size: 10
//! limits:
//!   max_failure_ratio: 0.5
//! ```
//!
//! Library callers usually go through [`PipelineConfig::builder()`] instead.

use crate::cost::PriceTable;
use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Full configuration of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub parser: ParserConfig,
    pub extractor: ExtractorConfig,
    pub qa_generator: QaGeneratorConfig,
    pub export: ExportConfig,
    pub costs: CostsConfig,
    pub limits: LimitsConfig,
}

/// Document parsing and local re-chunking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Maximum chunk length in characters. Default: 1500.
    pub chunk_size: usize,

    /// Characters shared by consecutive chunks. Must be below `chunk_size`.
    /// Default: 200.
    pub chunk_overlap: usize,

    /// Document language hint passed to the parsing service. Default: "en".
    pub language: String,

    /// Environment variable holding the parsing-service key.
    /// Default: `LLAMA_CLOUD_API_KEY`.
    pub api_key_env: String,

    /// Ask the service for one segment per page. Default: true.
    ///
    /// When off, the pages come back as one continuous text and chunk pages
    /// are attributed from the reported page offsets instead.
    pub split_by_page: bool,

    /// Parsing-service endpoint.
    pub base_url: String,

    /// Delay between job-status polls in milliseconds. Default: 1000.
    pub poll_interval_ms: u64,

    /// Give up on a parsing job after this many seconds. Default: 300.
    pub timeout_secs: u64,

    /// Attempts per parsing request (upload, status poll, result), including
    /// the first. Default: 3.
    pub max_retries: u32,

    /// Initial backoff in milliseconds, doubled per retry. Default: 500.
    pub retry_backoff_ms: u64,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1500,
            chunk_overlap: 200,
            language: "en".to_string(),
            api_key_env: "LLAMA_CLOUD_API_KEY".to_string(),
            split_by_page: true,
            base_url: "https://api.cloud.llamaindex.ai".to_string(),
            poll_interval_ms: 1000,
            timeout_secs: 300,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl ParserConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_backoff_ms))
    }
}

/// Schema-constrained statement extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// LLM provider name ("openai", "anthropic", "ollama", ...). When unset
    /// the provider is inferred from the model name or the environment.
    pub provider: Option<String>,

    /// Chat model id. Default: "gpt-3.5-turbo".
    pub model: String,

    /// JSON schema every extracted object must satisfy. When unset, a
    /// built-in `{statement, page}` schema is used.
    pub schema_path: Option<PathBuf>,

    /// Environment variable holding the model-provider key.
    /// Default: `OPENAI_API_KEY`.
    pub api_key_env: String,

    /// Default: 0.0.
    pub temperature: f32,

    /// Default: 1000.
    pub max_tokens: usize,

    /// Chunks in flight at once. Default: 4.
    pub concurrency: usize,

    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            provider: None,
            model: "gpt-3.5-turbo".to_string(),
            schema_path: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.0,
            max_tokens: 1000,
            concurrency: 4,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl ExtractorConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_backoff_ms))
    }
}

/// Two-step question/answer generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QaGeneratorConfig {
    pub provider: Option<String>,

    /// Chat model id. Default: "gpt-3.5-turbo".
    pub model: String,

    /// Passed through verbatim. Default: 0.0.
    pub temperature: f32,

    /// Passed through verbatim. Default: 256.
    pub max_tokens: usize,

    /// Statements per batch. Default: 5.
    pub batch_size: usize,

    /// Environment variable holding the model-provider key.
    /// Default: `OPENAI_API_KEY`.
    pub api_key_env: String,

    /// Statements of one batch in flight at once. Default: 5.
    pub concurrency: usize,

    /// Pause between batches in milliseconds. Default: 1000.
    pub batch_delay_ms: u64,

    /// Attempts per call on transient failures. Default: 3.
    pub max_retries: u32,

    pub retry_backoff_ms: u64,

    /// Times a rate-limited batch is re-submitted before its remaining
    /// statements are skipped. Default: 3.
    pub max_batch_retries: u32,
}

impl Default for QaGeneratorConfig {
    fn default() -> Self {
        Self {
            provider: None,
            model: "gpt-3.5-turbo".to_string(),
            temperature: 0.0,
            max_tokens: 256,
            batch_size: 5,
            api_key_env: "OPENAI_API_KEY".to_string(),
            concurrency: 5,
            batch_delay_ms: 1000,
            max_retries: 3,
            retry_backoff_ms: 500,
            max_batch_retries: 3,
        }
    }
}

impl QaGeneratorConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_backoff_ms))
    }
}

/// Layout of one line of the Q/A JSONL file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaFormat {
    /// `{"messages":[{"role":"user",...},{"role":"assistant",...}]}`
    #[default]
    Messages,
    /// `{"prompt":...,"completion":...,"metadata":{...}}`
    PromptCompletion,
}

/// Output locations. File names get the job id appended to the stem
/// (`content.json` → `content_{job}.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub content_path: PathBuf,
    pub qa_jsonl_path: PathBuf,
    pub qa_format: QaFormat,
    /// Directory for `summary_{job}.json`. Defaults to the content file's
    /// directory.
    pub summary_dir: Option<PathBuf>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            content_path: PathBuf::from("./output/content.json"),
            qa_jsonl_path: PathBuf::from("./output/qa.jsonl"),
            qa_format: QaFormat::default(),
            summary_dir: None,
        }
    }
}

impl ExportConfig {
    /// Point every output at `dir`, keeping the default file names.
    pub fn redirect_to(&mut self, dir: &Path) {
        self.content_path = dir.join("content.json");
        self.qa_jsonl_path = dir.join("qa.jsonl");
        self.summary_dir = Some(dir.to_path_buf());
    }

    pub fn content_path_for(&self, job_id: &str) -> PathBuf {
        namespaced(&self.content_path, job_id)
    }

    pub fn qa_path_for(&self, job_id: &str) -> PathBuf {
        namespaced(&self.qa_jsonl_path, job_id)
    }

    pub fn summary_path_for(&self, job_id: &str) -> PathBuf {
        let dir = self
            .summary_dir
            .clone()
            .or_else(|| self.content_path.parent().map(Path::to_path_buf))
            .unwrap_or_default();
        dir.join(format!("summary_{job_id}.json"))
    }
}

/// `dir/name.ext` → `dir/name_{job}.ext`
fn namespaced(path: &Path, job_id: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_{job_id}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{job_id}"),
    };
    path.with_file_name(name)
}

/// Cost ledger location and pricing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostsConfig {
    /// Persisted ledger, shared across runs. Default: `./output/costs.json`.
    pub ledger_path: PathBuf,
    pub pricing: PriceTable,
    /// Decimal places for USD figures in summaries. Default: 4.
    pub decimals: u32,
}

impl Default for CostsConfig {
    fn default() -> Self {
        Self {
            ledger_path: PathBuf::from("./output/costs.json"),
            pricing: PriceTable::default(),
            decimals: 4,
        }
    }
}

/// Tolerance for per-item failures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Abort a stage when failed/total exceeds this ratio. Unset: never abort.
    pub max_failure_ratio: Option<f64>,
}

impl LimitsConfig {
    /// True when `failed` out of `total` is beyond the configured tolerance.
    pub fn exceeded(&self, failed: usize, total: usize) -> bool {
        match self.max_failure_ratio {
            Some(max) if total > 0 => failed as f64 / total as f64 > max,
            _ => false,
        }
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Load from a YAML file, or JSON when the extension is `.json`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let config: Self = if is_json {
            serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?
        } else if raw.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
                path: path.to_path_buf(),
                source,
            })?
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject out-of-range or inconsistent values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.parser;
        if p.chunk_size == 0 {
            return Err(ConfigError::Invalid("parser.chunk_size must be ≥ 1".into()));
        }
        if p.chunk_overlap >= p.chunk_size {
            return Err(ConfigError::Invalid(format!(
                "parser.chunk_overlap ({}) must be smaller than parser.chunk_size ({})",
                p.chunk_overlap, p.chunk_size
            )));
        }
        if self.extractor.concurrency == 0 {
            return Err(ConfigError::Invalid("extractor.concurrency must be ≥ 1".into()));
        }
        let q = &self.qa_generator;
        if q.batch_size == 0 {
            return Err(ConfigError::Invalid("qa_generator.batch_size must be ≥ 1".into()));
        }
        if q.concurrency == 0 {
            return Err(ConfigError::Invalid("qa_generator.concurrency must be ≥ 1".into()));
        }
        for (name, t) in [
            ("extractor.temperature", self.extractor.temperature),
            ("qa_generator.temperature", q.temperature),
        ] {
            if !(0.0..=2.0).contains(&t) {
                return Err(ConfigError::Invalid(format!("{name} must be within 0.0–2.0, got {t}")));
            }
        }
        if let Some(r) = self.limits.max_failure_ratio {
            if !(0.0..=1.0).contains(&r) {
                return Err(ConfigError::Invalid(format!(
                    "limits.max_failure_ratio must be within 0.0–1.0, got {r}"
                )));
            }
        }
        Ok(())
    }
}

/// Read the key named by a section's `api_key_env`.
pub fn resolve_api_key(section: &str, env_var: &str) -> Result<String, ConfigError> {
    match std::env::var(env_var) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::MissingApiKey {
            section: section.to_string(),
            env_var: env_var.to_string(),
        }),
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn chunk_size(mut self, n: usize) -> Self {
        self.config.parser.chunk_size = n;
        self
    }

    pub fn chunk_overlap(mut self, n: usize) -> Self {
        self.config.parser.chunk_overlap = n;
        self
    }

    pub fn language(mut self, lang: impl Into<String>) -> Self {
        self.config.parser.language = lang.into();
        self
    }

    pub fn split_by_page(mut self, v: bool) -> Self {
        self.config.parser.split_by_page = v;
        self
    }

    pub fn extractor_model(mut self, model: impl Into<String>) -> Self {
        self.config.extractor.model = model.into();
        self
    }

    pub fn schema_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.extractor.schema_path = Some(path.into());
        self
    }

    pub fn qa_model(mut self, model: impl Into<String>) -> Self {
        self.config.qa_generator.model = model.into();
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.qa_generator.temperature = t;
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.qa_generator.max_tokens = n;
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.config.qa_generator.batch_size = n;
        self
    }

    pub fn batch_delay_ms(mut self, ms: u64) -> Self {
        self.config.qa_generator.batch_delay_ms = ms;
        self
    }

    /// Set the initial backoff of every retrying call site.
    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.parser.retry_backoff_ms = ms;
        self.config.extractor.retry_backoff_ms = ms;
        self.config.qa_generator.retry_backoff_ms = ms;
        self
    }

    pub fn output_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config.export.redirect_to(dir.as_ref());
        self
    }

    pub fn qa_format(mut self, format: QaFormat) -> Self {
        self.config.export.qa_format = format;
        self
    }

    pub fn ledger_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.costs.ledger_path = path.into();
        self
    }

    pub fn pricing(mut self, prices: PriceTable) -> Self {
        self.config.costs.pricing = prices;
        self
    }

    pub fn max_failure_ratio(mut self, ratio: f64) -> Self {
        self.config.limits.max_failure_ratio = Some(ratio);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
