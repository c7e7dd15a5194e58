//! Pipeline stages for PDF-to-Q/A generation.
//!
//! Each submodule implements one step. Stages share nothing but the
//! [`crate::cost::CostTracker`] they are handed, so each can be tested on
//! its own with a mock service.
//!
//! ## Data Flow
//!
//! ```text
//! parse ──▶ extract ──▶ qa ──▶ export
//! (chunks)  (statements) (pairs)  (JSON / JSONL)
//! ```
//!
//! 1. [`parse`]    call the parsing service, then re-chunk with [`chunking`]
//! 2. [`extract`]  one schema-constrained LLM call per chunk
//! 3. [`qa`]       question then answer per statement, batched and paced
//! 4. [`export`]   content JSON and Q/A JSONL, written atomically
//!
//! [`postprocess`] holds the deterministic cleanup applied to parsed pages
//! and model replies.

pub mod chunking;
pub mod export;
pub mod extract;
pub mod parse;
pub mod postprocess;
pub mod qa;
