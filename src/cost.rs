//! Cost and token accounting across every external call.
//!
//! A single [`CostTracker`] is created per process and handed to each stage
//! by `Arc`. Every call site reports one [`ApiCall`]; the tracker folds it
//! into a ledger keyed by `(job, service, model)` and persists the whole
//! ledger before returning, so a crash loses at most the call in flight.
//!
//! Amounts are held as integer nano-dollars ([`Cost`]). Token prices are
//! quoted per million tokens with at most three decimals, and per-page
//! prices in tenths of a cent, so every price is a whole number of
//! nano-dollars and ledger sums are exact.
//!
//! ## On-disk format
//!
//! ```json
//! {
//!   "total_cost": 0.00315,
//!   "total_calls": 2,
//!   "by_service": { "parser": { "cost": 0.003, "calls": 1, ... } },
//!   "by_model":   { "llamaparse": { ... }, "gpt-4o-mini": { ... } },
//!   "by_job":     { "report": { ... } },
//!   "records":    [ { "job_id": "report", "service": "parser", ... } ]
//! }
//! ```
//!
//! `records` is the authoritative ledger; the aggregate maps are derived
//! views written for humans and other tools.

use crate::error::ExportError;
use crate::pipeline::export::write_atomic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

const NANOS_PER_USD: f64 = 1_000_000_000.0;

/// A monetary amount in nano-dollars.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cost(u64);

impl Cost {
    pub const ZERO: Cost = Cost(0);

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Round a dollar amount to the nearest nano-dollar. Negative and
    /// non-finite inputs become zero.
    pub fn from_usd(usd: f64) -> Self {
        if !usd.is_finite() || usd <= 0.0 {
            return Self::ZERO;
        }
        Self((usd * NANOS_PER_USD).round() as u64)
    }

    pub const fn nanos(self) -> u64 {
        self.0
    }

    pub fn usd(self) -> f64 {
        self.0 as f64 / NANOS_PER_USD
    }

    /// Dollar value rounded to `decimals` places.
    pub fn usd_rounded(self, decimals: u32) -> f64 {
        round_to(self.usd(), decimals)
    }

    pub fn saturating_mul(self, n: u64) -> Self {
        Self(self.0.saturating_mul(n))
    }

    pub fn saturating_sub(self, rhs: Cost) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl Add for Cost {
    type Output = Cost;
    fn add(self, rhs: Cost) -> Cost {
        Cost(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Cost {
    fn add_assign(&mut self, rhs: Cost) {
        *self = *self + rhs;
    }
}

impl Sum for Cost {
    fn sum<I: Iterator<Item = Cost>>(iter: I) -> Cost {
        iter.fold(Cost::ZERO, Add::add)
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${:.4}", self.usd())
    }
}

/// Round half away from zero to `decimals` places.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

// ── Pricing ──────────────────────────────────────────────────────────────

/// Input/output price of one chat model, USD per one million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPrice {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> Cost {
        // $P per 1M tokens is P × 1000 nano-dollars per token.
        let per_input = Cost::from_usd(self.input_per_million / 1_000_000.0);
        let per_output = Cost::from_usd(self.output_per_million / 1_000_000.0);
        per_input.saturating_mul(input_tokens) + per_output.saturating_mul(output_tokens)
    }
}

/// Prices used to turn token and page counts into [`Cost`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceTable {
    /// Parsing-service price per page, USD.
    pub parser_per_page: f64,
    /// Chat-model prices keyed by model id.
    pub models: BTreeMap<String, ModelPrice>,
    /// Model whose price applies to ids missing from `models`.
    pub fallback_model: String,
}

impl Default for PriceTable {
    fn default() -> Self {
        let models = [
            ("gpt-3.5-turbo", ModelPrice::new(0.50, 1.50)),
            ("gpt-4o-mini", ModelPrice::new(0.15, 0.60)),
            ("gpt-4o", ModelPrice::new(2.50, 10.00)),
            ("gpt-4", ModelPrice::new(30.00, 60.00)),
            ("gpt-4-turbo", ModelPrice::new(10.00, 30.00)),
            ("gpt-4.1-nano", ModelPrice::new(0.10, 0.40)),
            ("gpt-4.1-mini", ModelPrice::new(0.40, 1.60)),
            ("gpt-4.1", ModelPrice::new(2.00, 8.00)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            parser_per_page: 0.003,
            models,
            fallback_model: "gpt-3.5-turbo".to_string(),
        }
    }
}

impl PriceTable {
    pub fn page_cost(&self, pages: u64) -> Cost {
        Cost::from_usd(self.parser_per_page).saturating_mul(pages)
    }

    pub fn token_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> Cost {
        let price = match self.models.get(model) {
            Some(p) => *p,
            None => {
                warn!(
                    "No price for model '{}', using '{}' pricing",
                    model, self.fallback_model
                );
                self.models
                    .get(&self.fallback_model)
                    .copied()
                    .unwrap_or(ModelPrice::new(0.0, 0.0))
            }
        };
        price.cost(input_tokens, output_tokens)
    }
}

// ── Ledger ───────────────────────────────────────────────────────────────

/// One external API call as reported by a call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCall {
    pub job_id: Option<String>,
    pub service: String,
    pub model: String,
    pub cost: Cost,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl ApiCall {
    pub fn new(service: impl Into<String>, model: impl Into<String>, cost: Cost) -> Self {
        Self {
            job_id: None,
            service: service.into(),
            model: model.into(),
            cost,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    pub fn tokens(mut self, input: u64, output: u64) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn for_job(mut self, job_id: Option<&str>) -> Self {
        self.job_id = job_id.map(str::to_string);
        self
    }
}

/// Accumulated totals for one ledger key or aggregate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostRecord {
    pub call_count: u64,
    #[serde(rename = "cost_nanos")]
    pub cost: Cost,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl CostRecord {
    fn absorb(&mut self, cost: Cost, calls: u64, input: u64, output: u64) {
        self.call_count += calls;
        self.cost += cost;
        self.input_tokens += input;
        self.output_tokens += output;
    }

    fn merge(&mut self, other: &CostRecord) {
        self.absorb(other.cost, other.call_count, other.input_tokens, other.output_tokens);
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
struct LedgerKey {
    job_id: Option<String>,
    service: String,
    model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerEntry {
    #[serde(flatten)]
    key: LedgerKey,
    #[serde(flatten)]
    record: CostRecord,
}

/// Which field to aggregate by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breakdown {
    Service,
    Model,
    Job,
}

/// Read-only aggregate view of (part of) the ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSnapshot {
    pub total: CostRecord,
    pub by_service: BTreeMap<String, CostRecord>,
    pub by_model: BTreeMap<String, CostRecord>,
}

impl CostSnapshot {
    pub fn total_cost(&self) -> Cost {
        self.total.cost
    }
}

/// Human-facing aggregate written next to the records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AggregateView {
    cost: f64,
    calls: u64,
    input_tokens: u64,
    output_tokens: u64,
}

impl From<&CostRecord> for AggregateView {
    fn from(r: &CostRecord) -> Self {
        Self {
            cost: r.cost.usd(),
            calls: r.call_count,
            input_tokens: r.input_tokens,
            output_tokens: r.output_tokens,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    total_cost: f64,
    total_calls: u64,
    #[serde(default)]
    by_service: BTreeMap<String, AggregateView>,
    #[serde(default)]
    by_model: BTreeMap<String, AggregateView>,
    #[serde(default)]
    by_job: BTreeMap<String, AggregateView>,
    #[serde(default)]
    records: Vec<LedgerEntry>,
}

/// Process-wide, persisted ledger of API costs.
///
/// All mutation goes through one `Mutex`, and persistence happens while the
/// lock is held, so concurrent callers never lose an update and the file
/// always reflects a state the in-memory ledger actually passed through.
#[derive(Debug)]
pub struct CostTracker {
    path: Option<PathBuf>,
    prices: PriceTable,
    ledger: Mutex<BTreeMap<LedgerKey, CostRecord>>,
}

impl CostTracker {
    /// Open (or start) the ledger stored at `path`.
    ///
    /// An unreadable or malformed file is logged and replaced by an empty
    /// ledger; it is never fatal.
    pub fn open(path: impl Into<PathBuf>, prices: PriceTable) -> Self {
        let path = path.into();
        let ledger = match load_ledger(&path) {
            Ok(Some(entries)) => {
                info!("Loaded {} cost records from {}", entries.len(), path.display());
                entries
            }
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                warn!("Could not load cost ledger {}: {}", path.display(), e);
                BTreeMap::new()
            }
        };
        Self {
            path: Some(path),
            prices,
            ledger: Mutex::new(ledger),
        }
    }

    /// A ledger that is never written to disk.
    pub fn in_memory(prices: PriceTable) -> Self {
        Self {
            path: None,
            prices,
            ledger: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Fold one call into the ledger and persist it.
    ///
    /// Persistence failures are logged; the in-memory ledger stays
    /// authoritative for the rest of the run.
    pub fn record_call(&self, call: ApiCall) -> Cost {
        let mut ledger = self.lock();
        let key = LedgerKey {
            job_id: call.job_id,
            service: call.service,
            model: call.model,
        };
        debug!(
            "{}/{}: {} in / {} out tokens, {}",
            key.service, key.model, call.input_tokens, call.output_tokens, call.cost
        );
        ledger
            .entry(key)
            .or_default()
            .absorb(call.cost, 1, call.input_tokens, call.output_tokens);
        self.persist_locked(&ledger);
        call.cost
    }

    /// Price and record a chat call from its token usage.
    pub fn record_tokens(
        &self,
        job_id: Option<&str>,
        service: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Cost {
        let cost = self.prices.token_cost(model, input_tokens, output_tokens);
        self.record_call(
            ApiCall::new(service, model, cost)
                .tokens(input_tokens, output_tokens)
                .for_job(job_id),
        )
    }

    /// Price and record a parsing call from its page count. The page count
    /// is stored in `input_tokens`.
    pub fn record_pages(
        &self,
        job_id: Option<&str>,
        service: &str,
        model: &str,
        pages: u64,
    ) -> Cost {
        let cost = self.prices.page_cost(pages);
        self.record_call(ApiCall::new(service, model, cost).tokens(pages, 0).for_job(job_id))
    }

    pub fn total_cost(&self) -> Cost {
        self.lock().values().map(|r| r.cost).sum()
    }

    pub fn total_calls(&self) -> u64 {
        self.lock().values().map(|r| r.call_count).sum()
    }

    /// Aggregate the whole ledger by one dimension.
    pub fn breakdown_by(&self, dimension: Breakdown) -> BTreeMap<String, CostRecord> {
        aggregate(self.lock().iter(), dimension)
    }

    /// Totals for every job (`None` = the whole ledger).
    pub fn snapshot(&self, job_id: Option<&str>) -> CostSnapshot {
        let ledger = self.lock();
        let entries: Vec<(&LedgerKey, &CostRecord)> = ledger
            .iter()
            .filter(|(k, _)| job_id.is_none() || k.job_id.as_deref() == job_id)
            .collect();

        let mut total = CostRecord::default();
        for (_, r) in &entries {
            total.merge(r);
        }
        CostSnapshot {
            total,
            by_service: aggregate(entries.iter().copied(), Breakdown::Service),
            by_model: aggregate(entries.iter().copied(), Breakdown::Model),
        }
    }

    /// Write the current ledger to disk now.
    pub fn flush(&self) -> Result<(), ExportError> {
        let ledger = self.lock();
        match &self.path {
            Some(path) => write_ledger(path, &ledger),
            None => Ok(()),
        }
    }

    /// Clear every record and persist the empty ledger.
    pub fn reset(&self) -> Result<(), ExportError> {
        let mut ledger = self.lock();
        ledger.clear();
        info!("Cost ledger reset");
        match &self.path {
            Some(path) => write_ledger(path, &ledger),
            None => Ok(()),
        }
    }

    fn persist_locked(&self, ledger: &BTreeMap<LedgerKey, CostRecord>) {
        if let Some(path) = &self.path {
            if let Err(e) = write_ledger(path, ledger) {
                warn!("Could not save cost ledger: {}", e);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<LedgerKey, CostRecord>> {
        // Poisoning is ignored: every update is a handful of integer additions.
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn aggregate<'a>(
    entries: impl Iterator<Item = (&'a LedgerKey, &'a CostRecord)>,
    dimension: Breakdown,
) -> BTreeMap<String, CostRecord> {
    let mut out: BTreeMap<String, CostRecord> = BTreeMap::new();
    for (key, record) in entries {
        let name = match dimension {
            Breakdown::Service => key.service.clone(),
            Breakdown::Model => key.model.clone(),
            Breakdown::Job => match &key.job_id {
                Some(j) => j.clone(),
                None => continue,
            },
        };
        out.entry(name).or_default().merge(record);
    }
    out
}

fn load_ledger(path: &Path) -> Result<Option<BTreeMap<LedgerKey, CostRecord>>, ExportError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read(path).map_err(|source| ExportError::ReadFailed {
        path: path.to_path_buf(),
        source,
    })?;
    let file: LedgerFile = serde_json::from_slice(&raw).map_err(|source| ExportError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;
    let mut ledger = BTreeMap::new();
    for entry in file.records {
        ledger
            .entry(entry.key)
            .or_insert_with(CostRecord::default)
            .merge(&entry.record);
    }
    Ok(Some(ledger))
}

fn write_ledger(path: &Path, ledger: &BTreeMap<LedgerKey, CostRecord>) -> Result<(), ExportError> {
    let view = |d: Breakdown| -> BTreeMap<String, AggregateView> {
        aggregate(ledger.iter(), d)
            .iter()
            .map(|(k, r)| (k.clone(), AggregateView::from(r)))
            .collect()
    };
    let file = LedgerFile {
        total_cost: ledger.values().map(|r| r.cost).sum::<Cost>().usd(),
        total_calls: ledger.values().map(|r| r.call_count).sum(),
        by_service: view(Breakdown::Service),
        by_model: view(Breakdown::Model),
        by_job: view(Breakdown::Job),
        records: ledger
            .iter()
            .map(|(key, record)| LedgerEntry {
                key: key.clone(),
                record: *record,
            })
            .collect(),
    };
    let bytes = serde_json::to_vec_pretty(&file).map_err(|source| ExportError::Serialize {
        what: "cost ledger",
        source,
    })?;
    write_atomic(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn cost_from_usd_is_exact_for_quoted_prices() {
        assert_eq!(Cost::from_usd(0.003).nanos(), 3_000_000);
        assert_eq!(Cost::from_usd(-1.0), Cost::ZERO);
        assert_eq!(Cost::from_usd(f64::NAN), Cost::ZERO);
    }

    #[test]
    fn token_pricing() {
        let prices = PriceTable::default();
        // gpt-4o-mini: $0.15 / 1M input, $0.60 / 1M output
        let cost = prices.token_cost("gpt-4o-mini", 1000, 500);
        assert_eq!(cost.nanos(), 150_000 + 300_000);
    }

    #[test]
    fn unknown_model_uses_fallback_price() {
        let prices = PriceTable::default();
        assert_eq!(
            prices.token_cost("mystery-model", 1000, 1000),
            prices.token_cost("gpt-3.5-turbo", 1000, 1000)
        );
    }

    #[test]
    fn parse_plus_generation_sums_exactly() {
        let tracker = CostTracker::in_memory(PriceTable::default());
        let parse = tracker.record_pages(Some("job"), "parser", "llamaparse", 1);
        let gen = tracker.record_tokens(Some("job"), "qa_generator", "gpt-4o-mini", 1000, 0);
        assert_eq!(parse.nanos(), 3_000_000);
        assert_eq!(gen.nanos(), 150_000);
        assert_eq!(tracker.total_cost(), parse + gen);
        assert_eq!(tracker.total_cost().usd_rounded(5), 0.00315);
        assert_eq!(tracker.total_cost().usd_rounded(2), 0.0);
    }

    #[test]
    fn breakdowns_group_by_service_and_model() {
        let tracker = CostTracker::in_memory(PriceTable::default());
        tracker.record_pages(Some("a"), "parser", "llamaparse", 2);
        tracker.record_tokens(Some("a"), "extractor", "gpt-4o-mini", 100, 10);
        tracker.record_tokens(Some("b"), "qa_generator", "gpt-4o-mini", 100, 10);

        let by_service = tracker.breakdown_by(Breakdown::Service);
        assert_eq!(by_service.len(), 3);
        assert_eq!(by_service["parser"].call_count, 1);

        let by_model = tracker.breakdown_by(Breakdown::Model);
        assert_eq!(by_model["gpt-4o-mini"].call_count, 2);
        assert_eq!(by_model["gpt-4o-mini"].input_tokens, 200);

        let by_job = tracker.breakdown_by(Breakdown::Job);
        assert_eq!(by_job["a"].call_count, 2);
        assert_eq!(by_job["b"].call_count, 1);
    }

    #[test]
    fn job_snapshot_excludes_other_jobs() {
        let tracker = CostTracker::in_memory(PriceTable::default());
        tracker.record_pages(Some("a"), "parser", "llamaparse", 1);
        tracker.record_pages(Some("b"), "parser", "llamaparse", 5);
        let snap = tracker.snapshot(Some("a"));
        assert_eq!(snap.total.call_count, 1);
        assert_eq!(snap.total_cost().nanos(), 3_000_000);
        assert_eq!(tracker.snapshot(None).total.call_count, 2);
    }

    #[test]
    fn concurrent_writers_lose_nothing() {
        let tracker = Arc::new(CostTracker::in_memory(PriceTable::default()));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    let mut sum = Cost::ZERO;
                    for i in 0..250u64 {
                        let model = format!("m{}", t % 3);
                        let call = ApiCall::new("svc", model, Cost::from_nanos(i + t)).tokens(i, 1);
                        sum += tracker.record_call(call);
                    }
                    sum
                })
            })
            .collect();
        let expected: Cost = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(tracker.total_cost(), expected);
        assert_eq!(tracker.total_calls(), 2000);
    }

    #[test]
    fn ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("costs.json");
        {
            let tracker = CostTracker::open(&path, PriceTable::default());
            tracker.record_pages(Some("job"), "parser", "llamaparse", 3);
            tracker.record_tokens(Some("job"), "qa_generator", "gpt-4o", 1000, 1000);
        }
        let reopened = CostTracker::open(&path, PriceTable::default());
        assert_eq!(reopened.total_calls(), 2);
        assert_eq!(
            reopened.total_cost(),
            Cost::from_usd(0.009) + PriceTable::default().token_cost("gpt-4o", 1000, 1000)
        );

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(raw["total_cost"].as_f64().unwrap() > 0.0);
        assert_eq!(raw["by_service"]["parser"]["calls"], 1);
        assert_eq!(raw["by_job"]["job"]["calls"], 2);
    }

    #[test]
    fn corrupt_ledger_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("costs.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let tracker = CostTracker::open(&path, PriceTable::default());
        assert_eq!(tracker.total_calls(), 0);
        tracker.record_pages(None, "parser", "llamaparse", 1);
        assert_eq!(CostTracker::open(&path, PriceTable::default()).total_calls(), 1);
    }

    #[test]
    fn reset_clears_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("costs.json");
        let tracker = CostTracker::open(&path, PriceTable::default());
        tracker.record_pages(None, "parser", "llamaparse", 1);
        tracker.reset().unwrap();
        assert_eq!(tracker.total_cost(), Cost::ZERO);
        assert_eq!(CostTracker::open(&path, PriceTable::default()).total_calls(), 0);
    }
}
