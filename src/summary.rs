//! Job summaries: what one pipeline run did, how long it took, what it cost.
//!
//! A [`JobSummary`] is composed once at the end of a run from the stage
//! metrics collected by the pipeline plus a [`CostSnapshot`] filtered to the
//! job, then written atomically as pretty JSON. It is never modified after
//! it has been written; `pdf2qa summary <file>` only reads it back.

use crate::cost::{round_to, Cost, CostRecord, CostSnapshot};
use crate::error::ExportError;
use crate::pipeline::export::write_atomic;
use crate::progress::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

/// Source document facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Pages reported by the parsing service, or the distinct pages of the
    /// reloaded chunks when parsing was skipped.
    pub pages: u32,
}

/// Wall-clock time of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub duration_secs: f64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputCounts {
    pub chunks: usize,
    pub statements: usize,
    pub qa_pairs: usize,
}

/// Per-item failures that did not stop the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCounts {
    /// Extracted objects dropped for violating the schema.
    pub invalid_statements: usize,
    /// Chunks whose extraction call or reply failed.
    pub failed_chunks: usize,
    /// `invalid_statements + failed_chunks`.
    pub extraction_failures: usize,
    /// Statements that produced no Q/A pair.
    pub skipped_statements: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Ratios {
    pub statements_per_chunk: f64,
    pub qa_pairs_per_statement: f64,
}

/// One ledger aggregate in dollars.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostLine {
    pub cost_usd: f64,
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl CostLine {
    fn from_record(record: &CostRecord, decimals: u32) -> Self {
        Self {
            cost_usd: record.cost.usd_rounded(decimals),
            calls: record.call_count,
            input_tokens: record.input_tokens,
            output_tokens: record.output_tokens,
        }
    }
}

/// The job's share of the cost ledger. Totals are cumulative over every run
/// recorded under the job id; `run_cost_usd` is this run alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_cost_usd: f64,
    #[serde(default)]
    pub run_cost_usd: f64,
    pub total_calls: u64,
    pub total_tokens: u64,
    pub by_service: BTreeMap<String, CostLine>,
    pub by_model: BTreeMap<String, CostLine>,
    pub cost_per_page: f64,
    pub cost_per_qa_pair: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Throughput {
    pub total_duration_secs: f64,
    pub pages_per_minute: f64,
    pub statements_per_minute: f64,
    pub qa_pairs_per_minute: f64,
}

/// One file the job wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Everything recorded about one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub document: DocumentInfo,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<StageTiming>,
    pub counts: OutputCounts,
    pub ratios: Ratios,
    pub failures: FailureCounts,
    pub costs: CostSummary,
    pub throughput: Throughput,
    /// Keyed by role: `content`, `qa`.
    pub outputs: BTreeMap<String, OutputFile>,
}

/// Raw measurements collected while the pipeline runs.
#[derive(Debug, Clone)]
pub struct JobMetrics {
    pub job_id: String,
    pub document: DocumentInfo,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<StageTiming>,
    pub counts: OutputCounts,
    pub failures: FailureCounts,
    pub outputs: Vec<(String, PathBuf)>,
    /// The job's ledger total when the run started.
    pub prior_cost: Cost,
}

impl JobMetrics {
    pub fn new(job_id: impl Into<String>, document: DocumentInfo) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            document,
            started_at: now,
            finished_at: now,
            stages: Vec::new(),
            counts: OutputCounts::default(),
            failures: FailureCounts::default(),
            outputs: Vec::new(),
            prior_cost: Cost::ZERO,
        }
    }

    pub fn record_stage(&mut self, stage: Stage, duration_secs: f64) {
        self.stages.push(StageTiming {
            stage,
            duration_secs,
            skipped: false,
        });
    }

    pub fn record_skipped(&mut self, stage: Stage) {
        self.stages.push(StageTiming {
            stage,
            duration_secs: 0.0,
            skipped: true,
        });
    }

    pub fn add_output(&mut self, role: impl Into<String>, path: impl Into<PathBuf>) {
        self.outputs.push((role.into(), path.into()));
    }

    fn total_secs(&self) -> f64 {
        (self.finished_at - self.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Composes and persists [`JobSummary`] files.
#[derive(Debug, Clone, Copy)]
pub struct SummaryGenerator {
    decimals: u32,
}

impl Default for SummaryGenerator {
    fn default() -> Self {
        Self { decimals: 4 }
    }
}

impl SummaryGenerator {
    /// `decimals` is the rounding applied to every dollar figure.
    pub fn new(decimals: u32) -> Self {
        Self { decimals }
    }

    pub fn compose(&self, metrics: &JobMetrics, costs: &CostSnapshot) -> JobSummary {
        let d = self.decimals;
        let counts = metrics.counts;
        let total = costs.total_cost();

        let costs = CostSummary {
            total_cost_usd: total.usd_rounded(d),
            run_cost_usd: total.saturating_sub(metrics.prior_cost).usd_rounded(d),
            total_calls: costs.total.call_count,
            total_tokens: costs.total.total_tokens(),
            by_service: lines(&costs.by_service, d),
            by_model: lines(&costs.by_model, d),
            cost_per_page: per_unit(total, metrics.document.pages as usize, d),
            cost_per_qa_pair: per_unit(total, counts.qa_pairs, d),
        };

        let secs = metrics.total_secs();
        let per_minute = |n: usize| {
            if secs > 0.0 {
                round_to(n as f64 * 60.0 / secs, 2)
            } else {
                0.0
            }
        };
        let throughput = Throughput {
            total_duration_secs: round_to(secs, 3),
            pages_per_minute: per_minute(metrics.document.pages as usize),
            statements_per_minute: per_minute(counts.statements),
            qa_pairs_per_minute: per_minute(counts.qa_pairs),
        };

        let ratio = |a: usize, b: usize| if b > 0 { round_to(a as f64 / b as f64, 2) } else { 0.0 };
        let ratios = Ratios {
            statements_per_chunk: ratio(counts.statements, counts.chunks),
            qa_pairs_per_statement: ratio(counts.qa_pairs, counts.statements),
        };

        let outputs = metrics
            .outputs
            .iter()
            .map(|(role, path)| {
                let size_bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
                (
                    role.clone(),
                    OutputFile {
                        path: path.clone(),
                        size_bytes,
                    },
                )
            })
            .collect();

        JobSummary {
            job_id: metrics.job_id.clone(),
            document: metrics.document.clone(),
            started_at: metrics.started_at,
            finished_at: metrics.finished_at,
            stages: metrics.stages.clone(),
            counts,
            ratios,
            failures: metrics.failures,
            costs,
            throughput,
            outputs,
        }
    }

    /// Write `summary` to `path` as pretty JSON.
    pub fn write(&self, summary: &JobSummary, path: &Path) -> Result<(), ExportError> {
        let json = serde_json::to_vec_pretty(summary).map_err(|source| ExportError::Serialize {
            what: "job summary",
            source,
        })?;
        write_atomic(path, &json)?;
        info!("Wrote job summary to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<JobSummary, ExportError> {
        let raw = std::fs::read(path).map_err(|source| ExportError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| ExportError::Malformed {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn lines(records: &BTreeMap<String, CostRecord>, decimals: u32) -> BTreeMap<String, CostLine> {
    records
        .iter()
        .map(|(k, r)| (k.clone(), CostLine::from_record(r, decimals)))
        .collect()
}

fn per_unit(total: Cost, units: usize, decimals: u32) -> f64 {
    if units == 0 {
        return 0.0;
    }
    round_to(total.usd() / units as f64, decimals)
}

impl fmt::Display for JobSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Job:        {}", self.job_id)?;
        writeln!(
            f,
            "Document:   {} ({} bytes, {} pages)",
            self.document.path.display(),
            self.document.size_bytes,
            self.document.pages
        )?;
        writeln!(
            f,
            "Duration:   {:.1}s ({} → {})",
            self.throughput.total_duration_secs,
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            self.finished_at.format("%H:%M:%S")
        )?;
        for s in &self.stages {
            if s.skipped {
                writeln!(f, "  {:<14} skipped", s.stage.name())?;
            } else {
                writeln!(f, "  {:<14} {:.1}s", s.stage.name(), s.duration_secs)?;
            }
        }
        writeln!(
            f,
            "Output:     {} chunks, {} statements, {} Q/A pairs",
            self.counts.chunks, self.counts.statements, self.counts.qa_pairs
        )?;
        writeln!(
            f,
            "Failures:   {} invalid statements, {} failed chunks, skipped: {} of {} statements",
            self.failures.invalid_statements,
            self.failures.failed_chunks,
            self.failures.skipped_statements,
            self.counts.statements
        )?;
        writeln!(
            f,
            "Cost:       ${:.4} this run, ${:.4} job total over {} calls (${:.4}/page, ${:.4}/pair)",
            self.costs.run_cost_usd,
            self.costs.total_cost_usd,
            self.costs.total_calls,
            self.costs.cost_per_page,
            self.costs.cost_per_qa_pair
        )?;
        for (service, line) in &self.costs.by_service {
            writeln!(f, "  {:<14} ${:.4} ({} calls)", service, line.cost_usd, line.calls)?;
        }
        for (role, file) in &self.outputs {
            let label = format!("{role}:");
            writeln!(f, "{:<11} {} ({} bytes)", label, file.path.display(), file.size_bytes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::{CostTracker, PriceTable};
    use chrono::Duration;

    fn metrics() -> JobMetrics {
        let mut m = JobMetrics::new(
            "report",
            DocumentInfo {
                path: "report.pdf".into(),
                size_bytes: 2048,
                pages: 2,
            },
        );
        m.finished_at = m.started_at + Duration::seconds(60);
        m.record_stage(Stage::Parse, 1.5);
        m.record_skipped(Stage::Extract);
        m.counts = OutputCounts {
            chunks: 4,
            statements: 6,
            qa_pairs: 4,
        };
        m.failures.skipped_statements = 2;
        m
    }

    fn costs() -> CostSnapshot {
        let tracker = CostTracker::in_memory(PriceTable::default());
        tracker.record_pages(Some("report"), "parser", "llamaparse", 2);
        // 1000 in + 1000 out on gpt-3.5-turbo = $0.0005 + $0.0015.
        tracker.record_tokens(Some("report"), "qa_generator", "gpt-3.5-turbo", 1000, 1000);
        tracker.record_tokens(Some("other"), "qa_generator", "gpt-3.5-turbo", 1000, 1000);
        tracker.snapshot(Some("report"))
    }

    #[test]
    fn compose_derives_cost_and_ratio_metrics() {
        let s = SummaryGenerator::default().compose(&metrics(), &costs());
        assert_eq!(s.costs.total_cost_usd, 0.008);
        assert_eq!(s.costs.run_cost_usd, 0.008);
        assert_eq!(s.costs.total_calls, 2);
        assert_eq!(s.costs.cost_per_page, 0.004);
        assert_eq!(s.costs.cost_per_qa_pair, 0.002);
        assert_eq!(s.costs.by_service["parser"].cost_usd, 0.006);
        assert_eq!(s.ratios.statements_per_chunk, 1.5);
        assert_eq!(s.ratios.qa_pairs_per_statement, 0.67);
        assert_eq!(s.throughput.total_duration_secs, 60.0);
        assert_eq!(s.throughput.qa_pairs_per_minute, 4.0);
    }

    #[test]
    fn run_cost_excludes_earlier_runs_of_the_job() {
        let mut m = metrics();
        m.prior_cost = Cost::from_usd(0.006);
        let s = SummaryGenerator::default().compose(&m, &costs());
        assert_eq!(s.costs.total_cost_usd, 0.008);
        assert_eq!(s.costs.run_cost_usd, 0.002);
        assert!(s.to_string().contains("$0.0020 this run, $0.0080 job total"), "{s}");
    }

    #[test]
    fn zero_units_do_not_divide() {
        let mut m = metrics();
        m.document.pages = 0;
        m.counts = OutputCounts::default();
        m.finished_at = m.started_at;
        let s = SummaryGenerator::default().compose(&m, &CostSnapshot::default());
        assert_eq!(s.costs.cost_per_page, 0.0);
        assert_eq!(s.costs.cost_per_qa_pair, 0.0);
        assert_eq!(s.ratios.statements_per_chunk, 0.0);
        assert_eq!(s.throughput.pages_per_minute, 0.0);
    }

    #[test]
    fn write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let qa = dir.path().join("qa.jsonl");
        std::fs::write(&qa, "{}\n{}\n").unwrap();
        let mut m = metrics();
        m.add_output("qa", &qa);

        let generator = SummaryGenerator::default();
        let summary = generator.compose(&m, &costs());
        assert_eq!(summary.outputs["qa"].size_bytes, 6);

        let path = dir.path().join("summary_report.json");
        generator.write(&summary, &path).unwrap();
        assert_eq!(SummaryGenerator::load(&path).unwrap(), summary);
    }

    #[test]
    fn display_reports_skipped_statements() {
        let s = SummaryGenerator::default().compose(&metrics(), &costs());
        let text = s.to_string();
        assert!(text.contains("skipped: 2 of 6 statements"), "{text}");
        assert!(text.contains("extraction     skipped"), "{text}");
    }
}
