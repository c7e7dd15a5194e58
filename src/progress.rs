//! Progress-callback trait for per-stage and per-item pipeline events.
//!
//! Pass an [`Arc<dyn PipelineProgressCallback>`] to
//! [`crate::process::PipelineBuilder::progress`] to receive events as the
//! job moves through its stages. The CLI renders them with `indicatif`;
//! library callers can forward them anywhere.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdf2qa::{PipelineProgressCallback, Stage};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct Counter(AtomicUsize);
//!
//! impl PipelineProgressCallback for Counter {
//!     fn on_item_complete(&self, stage: Stage, _index: usize, _total: usize) {
//!         if stage == Stage::Generate {
//!             self.0.fetch_add(1, Ordering::SeqCst);
//!         }
//!     }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// The fixed stages of a job, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Parse,
    Extract,
    Generate,
    Export,
    Summary,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Parse,
        Stage::Extract,
        Stage::Generate,
        Stage::Export,
        Stage::Summary,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Parse => "parsing",
            Stage::Extract => "extraction",
            Stage::Generate => "qa_generation",
            Stage::Export => "export",
            Stage::Summary => "summary",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Called by the pipeline as it works through a job.
///
/// Items are chunks during extraction and statements during generation.
/// Item events of one stage may arrive concurrently and out of order;
/// implementations must synchronise their own state. All methods default to
/// no-ops.
pub trait PipelineProgressCallback: Send + Sync {
    /// A stage begins. `total_items` is 0 for stages without items.
    fn on_stage_start(&self, stage: Stage, total_items: usize) {
        let _ = (stage, total_items);
    }

    fn on_item_start(&self, stage: Stage, index: usize, total_items: usize) {
        let _ = (stage, index, total_items);
    }

    fn on_item_complete(&self, stage: Stage, index: usize, total_items: usize) {
        let _ = (stage, index, total_items);
    }

    /// An item failed and was dropped from the stage output.
    fn on_item_error(&self, stage: Stage, index: usize, total_items: usize, error: &str) {
        let _ = (stage, index, total_items, error);
    }

    /// The stage was skipped and its output reloaded from disk.
    fn on_stage_skipped(&self, stage: Stage) {
        let _ = stage;
    }

    fn on_stage_complete(&self, stage: Stage, succeeded: usize, total_items: usize) {
        let _ = (stage, succeeded, total_items);
    }
}

/// Default when no callback is configured.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl PipelineProgressCallback for Recorder {
        fn on_stage_start(&self, stage: Stage, total: usize) {
            self.events.lock().unwrap().push(format!("start {stage} {total}"));
        }

        fn on_item_error(&self, stage: Stage, index: usize, _total: usize, error: &str) {
            self.events.lock().unwrap().push(format!("error {stage} {index} {error}"));
        }

        fn on_stage_complete(&self, stage: Stage, ok: usize, total: usize) {
            self.events.lock().unwrap().push(format!("done {stage} {ok}/{total}"));
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_stage_start(Stage::Parse, 0);
        cb.on_item_start(Stage::Extract, 0, 3);
        cb.on_item_complete(Stage::Extract, 0, 3);
        cb.on_item_error(Stage::Generate, 1, 3, "timeout");
        cb.on_stage_skipped(Stage::Parse);
        cb.on_stage_complete(Stage::Export, 0, 0);
    }

    #[test]
    fn overridden_methods_receive_events() {
        let rec = Recorder::default();
        rec.on_stage_start(Stage::Extract, 2);
        rec.on_item_complete(Stage::Extract, 0, 2);
        rec.on_item_error(Stage::Extract, 1, 2, "bad json");
        rec.on_stage_complete(Stage::Extract, 1, 2);
        assert_eq!(
            *rec.events.lock().unwrap(),
            vec!["start extraction 2", "error extraction 1 bad json", "done extraction 1/2"]
        );
    }

    #[test]
    fn stages_are_ordered() {
        let mut sorted = Stage::ALL;
        sorted.sort();
        assert_eq!(sorted, Stage::ALL);
        assert_eq!(Stage::Generate.to_string(), "qa_generation");
    }
}
