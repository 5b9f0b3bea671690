//! VLM page processing: one structured-output call per page, with a
//! two-rung retry ladder.
//!
//! ## Scheduling
//!
//! Pages feed a worker pool of `concurrency` tasks pulling from a shared
//! queue (`buffer_unordered`): no batch barrier, a free worker immediately
//! takes the next page. Completion order is unspecified; the returned
//! vector is index-mapped back to input order, so
//! `results[i].page_no == i + 1` always holds.
//!
//! ## Retry ladder
//!
//! 1. First call at the configured temperature (0), phase `page-analysis`.
//! 2. Zero elements → one retry at 0.3, phase `page-analysis-retry`.
//!    Blank covers legitimately produce zero elements, but so does an
//!    over-cautious refusal; a slightly warmer second look tells them
//!    apart.
//! 3. Validator rejection → one retry at 0.5, phase
//!    `page-analysis-quality-retry`, with the detected issue types spelled
//!    out in the prompt. Residual issues are attached to the result, never
//!    retried again.

use crate::abort::AbortSignal;
use crate::config::PipelineConfig;
use crate::document::{Label, PageQuality, VlmBBox, VlmPageElement, VlmPageResult};
use crate::error::Result;
use crate::pipeline::textlayer::PageTextLayer;
use crate::pipeline::validator;
use crate::prompts;
use crate::usage::{TokenUsageAggregator, TokenUsageReport};
use crate::vision::{self, VisionCall, VisionMessage, VisionModel};
use futures::StreamExt;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Callback receiving a cumulative usage snapshot after each page.
pub type OnTokenUsage = Arc<dyn Fn(TokenUsageReport) + Send + Sync>;

/// Per-run context threaded through the pool.
#[derive(Clone, Default)]
pub struct ProcessContext {
    /// Per-page text layer injected as TEXT-REFERENCE blocks.
    pub page_texts: PageTextLayer,
    pub aggregator: TokenUsageAggregator,
    pub abort: AbortSignal,
    pub on_token_usage: Option<OnTokenUsage>,
}

/// Short-field element as emitted by the model.
#[derive(Debug, Deserialize)]
struct ShortElement {
    t: String,
    c: String,
    o: u32,
    l: Option<u32>,
    m: Option<String>,
    b: Option<[f64; 4]>,
}

#[derive(Debug, Deserialize)]
struct PageAnalysisResponse {
    e: Vec<ShortElement>,
}

/// Expand short-field elements to [`VlmPageElement`]s.
///
/// Unknown type codes are dropped with a warning rather than failing the
/// page; the quality retry already covers systematically bad output.
fn decode_elements(response: PageAnalysisResponse, page_no: usize) -> Vec<VlmPageElement> {
    response
        .e
        .into_iter()
        .filter_map(|short| match Label::from_code(&short.t) {
            Some(label) => Some(VlmPageElement {
                label,
                content: short.c,
                order: short.o,
                level: short.l,
                marker: short.m,
                bbox: short.b.map(|[l, t, r, b]| VlmBBox { l, t, r, b }),
            }),
            None => {
                warn!("Page {}: dropping element with unknown type code '{}'", page_no, short.t);
                None
            }
        })
        .collect()
}

/// Drives the VLM over page images.
pub struct VlmPageProcessor {
    vision: Arc<dyn VisionModel>,
    config: PipelineConfig,
}

impl VlmPageProcessor {
    pub fn new(vision: Arc<dyn VisionModel>, config: PipelineConfig) -> Self {
        Self { vision, config }
    }

    /// Process every page image into a [`VlmPageResult`], preserving input
    /// order. `page_files[i]` is page `i + 1`.
    ///
    /// A vision call that exhausts its retries is fatal and aborts the
    /// whole run.
    pub async fn process_pages(
        &self,
        page_files: &[PathBuf],
        ctx: &ProcessContext,
    ) -> Result<Vec<VlmPageResult>> {
        info!(
            "Processing {} pages (concurrency={})",
            page_files.len(),
            self.config.concurrency
        );

        let mut indexed: Vec<(usize, Result<VlmPageResult>)> =
            futures::stream::iter(page_files.iter().enumerate().map(|(idx, path)| {
                let ctx = ctx.clone();
                async move {
                    let result = self.process_page(idx + 1, path, &ctx).await;
                    if let Some(ref callback) = ctx.on_token_usage {
                        callback(ctx.aggregator.report());
                    }
                    (idx, result)
                }
            }))
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        indexed.sort_by_key(|(idx, _)| *idx);
        indexed
            .into_iter()
            .map(|(_, result)| result)
            .collect::<Result<Vec<_>>>()
    }

    /// Run the retry ladder for a single page.
    async fn process_page(
        &self,
        page_no: usize,
        page_file: &Path,
        ctx: &ProcessContext,
    ) -> Result<VlmPageResult> {
        ctx.abort.check()?;

        let png = tokio::fs::read(page_file).await.map_err(|e| {
            crate::error::HanjadocError::Internal(format!(
                "failed to read page raster '{}': {}",
                page_file.display(),
                e
            ))
        })?;

        let base_prompt = self.base_prompt(page_no, ctx);
        let mut retried = false;

        // Rung 1: deterministic first pass.
        let mut elements = self
            .call_page(page_no, &png, &base_prompt, self.config.temperature, "page-analysis", ctx)
            .await?;

        // Rung 2: empty page → one warmer retry.
        if elements.is_empty() {
            debug!("Page {}: empty result, retrying at temperature 0.3", page_no);
            retried = true;
            elements = self
                .call_page(page_no, &png, &base_prompt, 0.3, "page-analysis-retry", ctx)
                .await?;
        }

        // Rung 3: validator rejection → one quality retry with the issues
        // named in the prompt.
        let mut validation = validator::validate(&elements, &self.config.document_languages);
        if !validation.is_valid {
            let issue_types = validation.issue_types();
            warn!(
                "Page {}: validation failed ({:?}), retrying at temperature 0.5",
                page_no, issue_types
            );
            retried = true;
            let augmented = format!(
                "{}{}",
                base_prompt,
                prompts::quality_retry_suffix(&issue_types)
            );
            let retry_elements = self
                .call_page(page_no, &png, &augmented, 0.5, "page-analysis-quality-retry", ctx)
                .await?;
            if !retry_elements.is_empty() {
                elements = retry_elements;
            }
            validation = validator::validate(&elements, &self.config.document_languages);
        }

        let quality = if retried || !validation.is_valid {
            Some(PageQuality {
                retried,
                issues: validation.issue_types(),
            })
        } else {
            None
        };

        Ok(VlmPageResult {
            page_no,
            elements,
            quality,
        })
    }

    /// One vision call; decoded to elements, usage tracked.
    async fn call_page(
        &self,
        page_no: usize,
        png: &[u8],
        prompt: &str,
        temperature: f32,
        phase: &'static str,
        ctx: &ProcessContext,
    ) -> Result<Vec<VlmPageElement>> {
        let call = VisionCall {
            schema: prompts::page_analysis_schema(),
            messages: vec![VisionMessage::user(vec![
                vision::text_part(prompt),
                vision::png_part(png),
            ])],
            primary_model: self.config.model.clone(),
            fallback_model: self.config.fallback_model.clone(),
            max_retries: self.config.max_retries,
            temperature,
            component: "vlm-page-processor",
            phase,
            abort: ctx.abort.clone(),
        };

        let response: PageAnalysisResponse =
            vision::call_and_track(self.vision.as_ref(), call, &ctx.aggregator).await?;
        Ok(decode_elements(response, page_no))
    }

    /// Assemble the per-page prompt: language context, then text-layer
    /// reference, then the fixed analysis prompt.
    fn base_prompt(&self, page_no: usize, ctx: &ProcessContext) -> String {
        let mut prompt = String::new();
        if !self.config.document_languages.is_empty() {
            prompt.push_str(&prompts::language_context(&self.config.document_languages));
        }
        if let Some(page_text) = ctx.page_texts.get(&page_no) {
            if !page_text.trim().is_empty() {
                prompt.push_str(&prompts::text_reference_block(page_text));
            }
        }
        prompt.push_str(prompts::PAGE_ANALYSIS_PROMPT);
        prompt
    }
}
