//! Eager end-to-end extraction entry point.
//!
//! Wires the stages together for the common case: decide the strategy,
//! then (on the VLM path) render, process, assemble, persist, and
//! correct. Callers needing finer control (streaming progress, a custom
//! strategy, re-running only the corrector) use the stage types directly.
//!
//! ## On-disk layout
//!
//! ```text
//! output_dir/
//!   result.json              canonical document (post-correction)
//!   result_ocr_origin.json   canonical document before correction
//!   pages/page_0.png …       page rasters, 0-based
//!   images/image_0.png …     cropped picture regions, 0-based
//! ```
//!
//! When the sampler picks the native OCR path, this function stops after
//! the decision (the native backend is an external collaborator) and
//! `document` is `None`.

use crate::abort::AbortSignal;
use crate::chapter::{convert_chapters, Chapter, PageRangeMap, TocEntry};
use crate::config::{PipelineConfig, StrategyOverride};
use crate::document::{CanonicalDocument, PageSize};
use crate::error::{HanjadocError, Result};
use crate::pipeline::assembler::{self, AssembleMetadata};
use crate::pipeline::corrector::{CorrectionSummary, CorrectorContext, VlmTextCorrector};
use crate::pipeline::input;
use crate::pipeline::processor::{ProcessContext, VlmPageProcessor};
use crate::pipeline::render::{PageRenderer, RenderOptions};
use crate::pipeline::sampler::{OcrMethod, OcrStrategySampler, StrategyDecision};
use crate::pipeline::textlayer::PdfTextExtractor;
use crate::usage::{TokenUsageAggregator, TokenUsageReport};
use crate::vision::VisionModel;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Everything an extraction run produced.
#[derive(Debug)]
pub struct ExtractOutput {
    pub strategy: StrategyDecision,
    /// The corrected canonical document; `None` on the native OCR path.
    pub document: Option<CanonicalDocument>,
    pub correction: Option<CorrectionSummary>,
    pub usage: TokenUsageReport,
    pub output_dir: PathBuf,
}

/// Run the full extraction pipeline on a local path or URL.
pub async fn extract(
    input_str: &str,
    vision: Arc<dyn VisionModel>,
    config: &PipelineConfig,
    output_dir: &Path,
    strategy_override: Option<StrategyOverride>,
    abort: AbortSignal,
) -> Result<ExtractOutput> {
    info!("Starting extraction: {}", input_str);
    let aggregator = TokenUsageAggregator::new();

    // ── Resolve input ────────────────────────────────────────────────────
    let resolved = input::resolve_input(input_str, config.download_timeout_secs).await?;
    let pdf_path = resolved.path().to_path_buf();

    // ── Decide strategy ──────────────────────────────────────────────────
    let strategy = match strategy_override {
        Some(forced) => StrategyDecision {
            method: forced.forced_method,
            reason: Some("forced by caller".to_string()),
            detected_languages: None,
            hanja_pages: None,
            sampled_pages: None,
            total_pages: None,
        },
        None => {
            let sampler = OcrStrategySampler::new(Arc::clone(&vision), config.clone());
            sampler.sample(&pdf_path, &aggregator, &abort).await?
        }
    };
    info!("Strategy: {:?} ({:?})", strategy.method, strategy.reason);

    if strategy.method == OcrMethod::OcrMac {
        // The native backend takes over from here.
        return Ok(ExtractOutput {
            strategy,
            document: None,
            correction: None,
            usage: aggregator.report(),
            output_dir: output_dir.to_path_buf(),
        });
    }

    // Detected languages flow into prompts unless the caller pinned them.
    let mut config = config.clone();
    if config.document_languages.is_empty() {
        if let Some(ref languages) = strategy.detected_languages {
            config.document_languages = languages.clone();
        }
    }

    // ── Render pages ─────────────────────────────────────────────────────
    let renderer = PageRenderer::new(&config.rasterizer_bin);
    let rendered = renderer
        .render(&pdf_path, output_dir, RenderOptions { dpi: config.dpi })
        .await?;

    // ── Extract the text layer ───────────────────────────────────────────
    let extractor = PdfTextExtractor::new(&config.pdftotext_bin, &config.pdfinfo_bin);
    let page_texts = extractor.extract_text(&pdf_path, rendered.page_count).await;

    // ── Read raster dimensions ───────────────────────────────────────────
    let page_dimensions = read_page_dimensions(&rendered.page_files).await;

    // ── VLM page processing ──────────────────────────────────────────────
    let processor = VlmPageProcessor::new(Arc::clone(&vision), config.clone());
    let ctx = ProcessContext {
        page_texts: page_texts.clone(),
        aggregator: aggregator.clone(),
        abort: abort.clone(),
        on_token_usage: None,
    };
    let results = processor.process_pages(&rendered.page_files, &ctx).await?;

    // ── Assemble and persist ─────────────────────────────────────────────
    let name = pdf_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let mut doc = assembler::assemble(
        &results,
        &AssembleMetadata {
            name,
            dpi: config.dpi,
            page_dimensions,
        },
    );
    assembler::attach_page_images(&mut doc);
    doc.save(&output_dir.join("result_ocr_origin.json")).await?;
    doc.save(&output_dir.join("result.json")).await?;

    {
        let mut doc_for_crops = doc.clone();
        let crop_dir = output_dir.to_path_buf();
        let cropped = tokio::task::spawn_blocking(move || {
            let written = assembler::crop_pictures(&mut doc_for_crops, &crop_dir)?;
            Ok::<_, HanjadocError>((written, doc_for_crops))
        })
        .await
        .map_err(|e| HanjadocError::Internal(format!("crop task panicked: {}", e)))??;
        info!("Cropped {} picture regions", cropped.0);
        doc = cropped.1;
        doc.save(&output_dir.join("result.json")).await?;
    }

    // ── Second-pass correction ───────────────────────────────────────────
    let corrector = VlmTextCorrector::new(Arc::clone(&vision), config.clone());
    let correction = corrector
        .correct_and_save(
            output_dir,
            &CorrectorContext {
                page_texts,
                hanja_pages: strategy.hanja_pages.clone(),
                aggregator: aggregator.clone(),
                abort: abort.clone(),
                on_token_usage: None,
            },
        )
        .await?;

    let document = CanonicalDocument::load(&output_dir.join("result.json")).await?;
    Ok(ExtractOutput {
        strategy,
        document: Some(document),
        correction: Some(correction),
        usage: aggregator.report(),
        output_dir: output_dir.to_path_buf(),
    })
}

/// Convert a persisted extraction result against a validated TOC.
pub async fn chapters_from_output(
    output_dir: &Path,
    toc: &[TocEntry],
    page_range_map: &PageRangeMap,
) -> Result<Vec<Chapter>> {
    let doc = CanonicalDocument::load(&output_dir.join("result.json")).await?;
    Ok(convert_chapters(&doc, toc, page_range_map))
}

/// Read the pixel dimensions of every rendered page.
///
/// PNG headers only, no full decode. Unreadable rasters lose their
/// dimensions (their elements fall back to zero prov boxes) but do not
/// abort the run.
async fn read_page_dimensions(page_files: &[PathBuf]) -> BTreeMap<usize, PageSize> {
    let files = page_files.to_vec();
    tokio::task::spawn_blocking(move || {
        let mut dims = BTreeMap::new();
        for (idx, file) in files.iter().enumerate() {
            match image::image_dimensions(file) {
                Ok((width, height)) => {
                    dims.insert(
                        idx + 1,
                        PageSize {
                            width: width as f64,
                            height: height as f64,
                        },
                    );
                }
                Err(e) => {
                    warn!("No dimensions for {}: {}", file.display(), e);
                }
            }
        }
        dims
    })
    .await
    .unwrap_or_default()
}
