//! # hanjadoc
//!
//! Structured OCR for scanned Korean archaeological reports (mixed Hangul
//! and Hanja) using Vision Language Models.
//!
//! ## Why this crate?
//!
//! Native OCR engines read modern Korean well but reliably mangle the
//! Hanja that saturates archaeological reports: site names, period terms,
//! and artefact labels come out as visually similar but wrong characters.
//! This crate decides per document whether the fast native path suffices,
//! and when it does not, drives a VLM page by page to produce a canonical
//! structured document (text, section hierarchy, pictures, tables, and
//! footnotes with provenance), then runs a second VLM pass that fixes
//! garbled Hanja by targeted substitution.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input     resolve local file or download from URL
//!  ├─ 2. Sample    text-layer pre-check, else VLM page sampling
//!  ├─ 3. Render    rasterise pages via the external rasteriser
//!  ├─ 4. Process   per-page VLM extraction with a retry ladder
//!  ├─ 5. Assemble  canonical document: refs, prov, caption links
//!  ├─ 6. Correct   second VLM pass, substitution-based Hanja repair
//!  └─ 7. Chapters  map against the TOC into a chapter tree
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hanjadoc::{extract, AbortSignal, PipelineConfig, VisionModel};
//! use std::sync::Arc;
//!
//! # async fn run(vision: Arc<dyn VisionModel>) -> Result<(), hanjadoc::HanjadocError> {
//! let config = PipelineConfig::builder().concurrency(4).build()?;
//! let output = extract(
//!     "report.pdf",
//!     vision,
//!     &config,
//!     std::path::Path::new("output/job-1"),
//!     None,
//!     AbortSignal::new(),
//! )
//! .await?;
//! println!("strategy: {:?}", output.strategy.method);
//! # Ok(())
//! # }
//! ```
//!
//! The VLM itself is abstracted behind [`VisionModel`]; the enclosing
//! application supplies the concrete client.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod abort;
pub mod chapter;
pub mod config;
pub mod convert;
pub mod document;
pub mod error;
pub mod pipeline;
pub mod prompts;
pub mod usage;
pub mod vision;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use abort::AbortSignal;
pub use chapter::{
    build_chapters, convert_chapters, Chapter, PageRangeMap, PageSpan, TextBlock, TocEntry,
    FRONT_MATTER_ID,
};
pub use config::{PipelineConfig, PipelineConfigBuilder, StrategyOverride};
pub use convert::{chapters_from_output, extract, ExtractOutput};
pub use document::{CanonicalDocument, Label, VlmPageElement, VlmPageResult};
pub use error::HanjadocError;
pub use pipeline::corrector::{CorrectionSummary, CorrectorContext, VlmTextCorrector};
pub use pipeline::processor::{ProcessContext, VlmPageProcessor};
pub use pipeline::sampler::{OcrMethod, OcrStrategySampler, StrategyDecision};
pub use usage::{TokenUsage, TokenUsageAggregator, TokenUsageReport};
pub use vision::{VisionCall, VisionContent, VisionMessage, VisionModel, VisionOutcome};
