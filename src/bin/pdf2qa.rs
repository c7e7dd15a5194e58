//! CLI binary for edgequake-pdf2qa.
//!
//! A thin shim over the library crate: maps flags onto `PipelineConfig`,
//! renders progress, and prints results.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edgequake_pdf2qa::{
    Breakdown, CancelFlag, CostRecord, CostTracker, JobRequest, Pipeline, PipelineConfig,
    PipelineProgressCallback, Stage, StageSkips, SummaryGenerator,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar, re-targeted at each stage as it starts.
struct CliProgressCallback {
    bar: ProgressBar,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Starting");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            errors: AtomicUsize::new(0),
        })
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

fn unit(stage: Stage) -> &'static str {
    match stage {
        Stage::Parse => "document",
        Stage::Extract => "chunks",
        Stage::Generate => "statements",
        Stage::Export => "files",
        Stage::Summary => "summary",
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_stage_start(&self, stage: Stage, total_items: usize) {
        let template = format!(
            "{{spinner:.cyan}} {{prefix:.bold}}  [{{bar:42.green/238}}] {{pos:>4}}/{{len}} {}  \
             ⏱ {{elapsed_precise}}  ETA {{eta_precise}}",
            unit(stage)
        );
        self.bar.set_style(
            ProgressStyle::with_template(&template)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▉▊▋▌▍▎▏  ")
                .tick_strings(TICKS),
        );
        self.bar.set_length(total_items as u64);
        self.bar.set_position(0);
        self.bar.set_prefix(stage.name());
        self.bar.reset_eta();
        self.errors.store(0, Ordering::SeqCst);
    }

    fn on_item_complete(&self, _stage: Stage, _index: usize, _total_items: usize) {
        self.bar.inc(1);
    }

    fn on_item_error(&self, stage: Stage, index: usize, total_items: usize, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let msg: String = if error.chars().count() > 100 {
            format!("{}\u{2026}", error.chars().take(99).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} {} {:>4}/{:<4} {}",
            red("✗"),
            stage.name(),
            index + 1,
            total_items,
            red(&msg)
        ));
        self.bar.inc(1);
    }

    fn on_stage_skipped(&self, stage: Stage) {
        let note = format!("{} skipped (reusing previous output)", stage.name());
        self.bar.println(format!("{} {}", dim("↷"), dim(&note)));
    }

    fn on_stage_complete(&self, stage: Stage, succeeded: usize, total_items: usize) {
        let failed = self.errors.load(Ordering::SeqCst);
        let mark = if failed == 0 { green("✔") } else { cyan("⚠") };
        let mut line = format!(
            "{} {:<14} {}/{} {}",
            mark,
            stage.name(),
            bold(&succeeded.to_string()),
            total_items,
            unit(stage)
        );
        if failed > 0 {
            line.push_str(&format!("  ({} failed)", red(&failed.to_string())));
        }
        self.bar.println(line);
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Full run: parse, extract, generate, export
  pdf2qa process --input report.pdf --output-dir ./output

  # Regenerate Q/A pairs from a previous run's content file
  pdf2qa process --input report.pdf --skip-parse --skip-extract

  # Custom configuration and job id
  pdf2qa process --input report.pdf --config config.yaml --job-id report-v2

  # Cost ledger
  pdf2qa costs
  pdf2qa costs --json
  pdf2qa costs --reset

  # Print a job summary
  pdf2qa summary ./output/summary_report.json

OUTPUT FILES (per job):
  content_{job}.json    chunks and statements with page provenance
  qa_{job}.jsonl        one {"messages":[user, assistant]} record per line
  summary_{job}.json    timings, counts, failures, costs
  costs.json            cost ledger shared across runs

ENVIRONMENT VARIABLES:
  LLAMA_CLOUD_API_KEY     Document-parsing service key
  OPENAI_API_KEY          Extraction / Q&A model key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  RUST_LOG                Override log filter (e.g. edgequake_pdf2qa=debug)
"#;

/// Turn PDF documents into fine-tuning Q/A pairs.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2qa",
    version,
    about = "Turn PDF documents into provenance-tagged chunks and fine-tuning Q/A pairs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PDF2QA_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PDF2QA_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline on one document.
    Process(ProcessArgs),
    /// Show (or reset) the cost ledger.
    Costs(CostsArgs),
    /// Print a job summary written by an earlier run.
    Summary(SummaryArgs),
}

#[derive(clap::Args, Debug)]
struct ProcessArgs {
    /// Document to process (pdf, docx, doc, txt).
    #[arg(short, long)]
    input: PathBuf,

    /// YAML or JSON configuration file.
    #[arg(short, long, env = "PDF2QA_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for content, Q/A and summary files.
    #[arg(short, long, env = "PDF2QA_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Job identifier used to name outputs and ledger records. Default: file stem.
    #[arg(long)]
    job_id: Option<String>,

    /// Reuse chunks from the job's content file.
    #[arg(long)]
    skip_parse: bool,

    /// Reuse statements from the job's content file.
    #[arg(long)]
    skip_extract: bool,

    /// Stop after extraction.
    #[arg(long)]
    skip_qa: bool,

    /// Maximum chunk size in characters.
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Characters shared by consecutive chunks.
    #[arg(long)]
    chunk_overlap: Option<usize>,

    /// Cost ledger file.
    #[arg(long, env = "PDF2QA_LEDGER")]
    ledger: Option<PathBuf>,

    /// Disable progress bar.
    #[arg(long, env = "PDF2QA_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(clap::Args, Debug)]
struct CostsArgs {
    /// Configuration file (for the ledger path and pricing).
    #[arg(short, long, env = "PDF2QA_CONFIG")]
    config: Option<PathBuf>,

    /// Cost ledger file.
    #[arg(long, env = "PDF2QA_LEDGER")]
    ledger: Option<PathBuf>,

    /// Print the ledger totals as JSON.
    #[arg(long)]
    json: bool,

    /// Clear every record.
    #[arg(long)]
    reset: bool,
}

#[derive(clap::Args, Debug)]
struct SummaryArgs {
    /// A summary_{job}.json file.
    path: PathBuf,

    /// Print the raw JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // INFO-level library logs are suppressed while the progress bar is up.
    let show_progress = matches!(&cli.command, Command::Process(a) if !a.no_progress) && !cli.quiet;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Process(args) => process(args, show_progress && !cli.verbose, cli.quiet).await,
        Command::Costs(args) => costs(args),
        Command::Summary(args) => summary(args),
    }
}

async fn process(args: ProcessArgs, show_progress: bool, quiet: bool) -> Result<()> {
    let config = build_config(&args)?;

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{} Cancelling after the current stage…", cyan("⚠"));
                cancel.cancel();
            }
        });
    }

    let progress = show_progress.then(CliProgressCallback::new);
    let mut builder = Pipeline::builder(config).cancel_flag(cancel);
    if let Some(cb) = &progress {
        builder = builder.progress(cb.clone());
    }
    let pipeline = builder.build().context("Invalid configuration")?;

    let mut request = JobRequest::new(&args.input).with_skips(StageSkips {
        parse: args.skip_parse,
        extract: args.skip_extract,
        qa: args.skip_qa,
    });
    if let Some(job_id) = &args.job_id {
        request = request.with_job_id(job_id);
    }

    let result = pipeline.run(&request).await;
    if let Some(cb) = &progress {
        cb.finish();
    }
    let report = result.with_context(|| format!("Processing {} failed", args.input.display()))?;

    if !quiet {
        let s = &report.summary;
        eprintln!(
            "{}  {} chunks  →  {} statements  →  {} Q/A pairs  in {:.1}s",
            if s.failures.skipped_statements == 0 && s.failures.extraction_failures == 0 {
                green("✔")
            } else {
                cyan("⚠")
            },
            s.counts.chunks,
            s.counts.statements,
            s.counts.qa_pairs,
            s.throughput.total_duration_secs
        );
        if s.failures.extraction_failures > 0 {
            eprintln!(
                "   extraction failures: {} ({} invalid statements, {} failed chunks)",
                s.failures.extraction_failures,
                s.failures.invalid_statements,
                s.failures.failed_chunks
            );
        }
        eprintln!(
            "   skipped: {} of {} statements",
            s.failures.skipped_statements, s.counts.statements
        );
        eprintln!(
            "   cost {}  ({} calls)",
            bold(&format!("${:.4}", s.costs.total_cost_usd)),
            s.costs.total_calls
        );
        for file in s.outputs.values() {
            eprintln!("   → {}", file.path.display());
        }
        eprintln!("   → {}", report.summary_path.display());
    }
    Ok(())
}

/// Load the config file (if any) and apply flag overrides.
fn build_config(args: &ProcessArgs) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path).context("Failed to load configuration")?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = &args.output_dir {
        config.export.redirect_to(dir);
    }
    if let Some(n) = args.chunk_size {
        config.parser.chunk_size = n;
    }
    if let Some(n) = args.chunk_overlap {
        config.parser.chunk_overlap = n;
    }
    if let Some(path) = &args.ledger {
        config.costs.ledger_path = path.clone();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn open_ledger(config: Option<&Path>, ledger: Option<&Path>) -> Result<CostTracker> {
    let config = match config {
        Some(path) => PipelineConfig::load(path).context("Failed to load configuration")?,
        None => PipelineConfig::default(),
    };
    let path = ledger
        .map(Path::to_path_buf)
        .unwrap_or(config.costs.ledger_path);
    Ok(CostTracker::open(path, config.costs.pricing))
}

fn costs(args: CostsArgs) -> Result<()> {
    let tracker = open_ledger(args.config.as_deref(), args.ledger.as_deref())?;
    let path = tracker
        .path()
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    if args.reset {
        tracker.reset().context("Failed to reset cost ledger")?;
        eprintln!("{} Cost ledger {} reset", green("✔"), bold(&path));
        return Ok(());
    }

    if args.json {
        let view = |m: BTreeMap<String, CostRecord>| -> serde_json::Value {
            m.into_iter()
                .map(|(k, r)| {
                    (
                        k,
                        json!({
                            "cost": r.cost.usd(),
                            "calls": r.call_count,
                            "input_tokens": r.input_tokens,
                            "output_tokens": r.output_tokens,
                        }),
                    )
                })
                .collect::<serde_json::Map<_, _>>()
                .into()
        };
        let out = json!({
            "total_cost": tracker.total_cost().usd(),
            "total_calls": tracker.total_calls(),
            "by_service": view(tracker.breakdown_by(Breakdown::Service)),
            "by_model": view(tracker.breakdown_by(Breakdown::Model)),
            "by_job": view(tracker.breakdown_by(Breakdown::Job)),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&out).context("Failed to serialise cost ledger")?
        );
        return Ok(());
    }

    println!("Ledger:      {}", path);
    println!("Total cost:  {}", tracker.total_cost());
    println!("Total calls: {}", tracker.total_calls());
    for (title, dimension) in [
        ("By service", Breakdown::Service),
        ("By model", Breakdown::Model),
        ("By job", Breakdown::Job),
    ] {
        let rows = tracker.breakdown_by(dimension);
        if rows.is_empty() {
            continue;
        }
        println!("\n{title}:");
        for (name, r) in rows {
            println!(
                "  {:<24} {:>10}  {:>6} calls  {:>9} in  {:>9} out",
                name,
                r.cost.to_string(),
                r.call_count,
                r.input_tokens,
                r.output_tokens
            );
        }
    }
    Ok(())
}

fn summary(args: SummaryArgs) -> Result<()> {
    let summary = SummaryGenerator::load(&args.path)
        .with_context(|| format!("Failed to read summary {}", args.path.display()))?;
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to serialise summary")?
        );
    } else {
        print!("{summary}");
    }
    Ok(())
}
