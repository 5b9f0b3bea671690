//! OCR strategy sampling: native OCR or the VLM pipeline?
//!
//! Most Korean reports with digital text layers are pure Hangul and cheap
//! to OCR natively. The expensive VLM path earns its cost only when Hangul
//! and Hanja are mixed, because native engines reliably mangle the Hanja. The
//! sampler answers "which path" as cheaply as possible:
//!
//! 1. **Text-layer pre-check**, free. If any sampled page's text layer
//!    mixes a Hangul syllable with a CJK ideograph, the answer is `vlm`
//!    without rendering a single pixel.
//! 2. **VLM sampling fallback**, for image-only PDFs. Render at 150 DPI
//!    into a scratch directory, show up to `max_sample_pages` pages to the
//!    model with a yes/no detection prompt.
//!
//! The scratch directory is a `TempDir`, so it is removed on success,
//! error, and cancellation alike.
//!
//! The native OCR backend itself is an external collaborator; this module
//! only emits the decision.

use crate::abort::AbortSignal;
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::pipeline::render::{PageRenderer, RenderOptions};
use crate::pipeline::textlayer::PdfTextExtractor;
use crate::prompts;
use crate::usage::TokenUsageAggregator;
use crate::vision::{self, VisionCall, VisionMessage, VisionModel};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// The two extraction strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OcrMethod {
    /// Fast native OCR path.
    #[serde(rename = "ocrmac")]
    OcrMac,
    /// Slow VLM path.
    #[serde(rename = "vlm")]
    Vlm,
}

/// The sampler's decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyDecision {
    pub method: OcrMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_languages: Option<Vec<String>>,
    /// 1-based pages whose text layer contains CJK ideographs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hanja_pages: Option<Vec<usize>>,
    /// Pages actually shown to the VLM during sampling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampled_pages: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetectionResponse {
    has_korean_hanja_mix: bool,
    detected_languages: Vec<String>,
}

/// Whether `c` is a Hangul syllable or jamo.
pub fn is_hangul(c: char) -> bool {
    matches!(c, '\u{AC00}'..='\u{D7AF}' | '\u{1100}'..='\u{11FF}')
}

/// Whether `c` is a CJK unified ideograph.
pub fn is_cjk(c: char) -> bool {
    matches!(c, '\u{4E00}'..='\u{9FFF}')
}

/// Select up to `max_samples` 0-based page indices from `total_pages`.
///
/// Covers and back matter skew sampling (the first and last ~10% of pages
/// are often title plates, blank leaves, and appendix tables), so the
/// eligible range is trimmed before spacing samples evenly across it.
pub fn select_sample_pages(total_pages: usize, max_samples: usize) -> Vec<usize> {
    if total_pages == 0 {
        return Vec::new();
    }
    if total_pages <= max_samples {
        return (0..total_pages).collect();
    }

    let trim = ((total_pages as f64 * 0.1).ceil() as usize).max(1);
    let eligible_start = trim;
    let eligible_end = total_pages.saturating_sub(trim);

    if eligible_end <= eligible_start {
        return vec![total_pages / 2];
    }

    let eligible = eligible_end - eligible_start;
    if eligible <= max_samples {
        return (eligible_start..eligible_end).collect();
    }

    let step = eligible as f64 / max_samples as f64;
    let mut indices: Vec<usize> = (0..max_samples)
        .map(|i| eligible_start + (i as f64 * step).round() as usize)
        .map(|i| i.min(eligible_end - 1))
        .collect();
    indices.sort_unstable();
    indices.dedup();
    indices
}

/// Outcome of the text-layer pre-check.
#[derive(Debug, PartialEq, Eq)]
enum Precheck {
    /// Some page mixes Hangul and CJK. Carries the first such page.
    Mixed { first_page: usize },
    /// Hangul present, no mixed page.
    HangulOnly,
    /// Empty/failed text layer, or no Hangul at all.
    Inconclusive,
}

/// Scan sampled page texts for the Hangul/CJK mix.
///
/// Returns the outcome plus every sampled page (1-based) whose text
/// contains a CJK ideograph.
fn precheck_texts<'a>(
    sampled: impl Iterator<Item = (usize, &'a str)>,
) -> (Precheck, Vec<usize>) {
    let mut hanja_pages = Vec::new();
    let mut first_mixed: Option<usize> = None;
    let mut saw_hangul = false;
    let mut saw_text = false;

    for (page, text) in sampled {
        if !text.trim().is_empty() {
            saw_text = true;
        }
        let has_hangul = text.chars().any(is_hangul);
        let has_cjk = text.chars().any(is_cjk);
        saw_hangul |= has_hangul;
        if has_cjk {
            hanja_pages.push(page);
        }
        if has_hangul && has_cjk && first_mixed.is_none() {
            first_mixed = Some(page);
        }
    }

    let outcome = match first_mixed {
        Some(first_page) => Precheck::Mixed { first_page },
        None if saw_text && saw_hangul => Precheck::HangulOnly,
        None => Precheck::Inconclusive,
    };
    (outcome, hanja_pages)
}

/// Text-layer pre-check over the sampled page set, without any VLM.
///
/// Returns `Ok(None)` when the text layer cannot decide (no pages, empty
/// layer, or no Hangul found) and VLM sampling should take over.
pub async fn precheck_text_layer(
    pdf_path: &Path,
    config: &PipelineConfig,
    abort: &AbortSignal,
) -> Result<Option<StrategyDecision>> {
    let extractor = PdfTextExtractor::new(&config.pdftotext_bin, &config.pdfinfo_bin);
    let total_pages = extractor.page_count(pdf_path).await;
    if total_pages == 0 {
        return Ok(None);
    }

    let indices = select_sample_pages(total_pages, config.max_sample_pages);
    let mut sampled: Vec<(usize, String)> = Vec::with_capacity(indices.len());
    for idx in &indices {
        abort.check()?;
        let page = idx + 1;
        let text = extractor.extract_page_text(pdf_path, page).await;
        sampled.push((page, text));
    }

    let (outcome, hanja_pages) = precheck_texts(sampled.iter().map(|(p, t)| (*p, t.as_str())));
    Ok(match outcome {
        Precheck::Mixed { first_page } => {
            info!("Text layer mixes Hangul and CJK on page {}", first_page);
            Some(StrategyDecision {
                method: OcrMethod::Vlm,
                reason: Some(format!("CJK characters found on page {}", first_page)),
                detected_languages: Some(vec!["ko-KR".to_string()]),
                hanja_pages: Some(hanja_pages),
                sampled_pages: None,
                total_pages: Some(total_pages),
            })
        }
        Precheck::HangulOnly => {
            info!("Text layer is Hangul-only; native OCR path selected");
            Some(StrategyDecision {
                method: OcrMethod::OcrMac,
                reason: None,
                detected_languages: Some(vec!["ko-KR".to_string()]),
                hanja_pages: None,
                sampled_pages: None,
                total_pages: Some(total_pages),
            })
        }
        Precheck::Inconclusive => {
            debug!("Text-layer pre-check inconclusive; falling back to VLM sampling");
            None
        }
    })
}

/// Decides the extraction strategy for one document.
pub struct OcrStrategySampler {
    vision: Arc<dyn VisionModel>,
    config: PipelineConfig,
}

impl OcrStrategySampler {
    pub fn new(vision: Arc<dyn VisionModel>, config: PipelineConfig) -> Self {
        Self { vision, config }
    }

    /// Decide the OCR method for `pdf_path`.
    ///
    /// VLM failures during sampling are fatal; text-layer failures degrade
    /// to the VLM sampling fallback.
    pub async fn sample(
        &self,
        pdf_path: &Path,
        aggregator: &TokenUsageAggregator,
        abort: &AbortSignal,
    ) -> Result<StrategyDecision> {
        abort.check()?;

        if let Some(decision) = precheck_text_layer(pdf_path, &self.config, abort).await? {
            return Ok(decision);
        }

        self.sample_with_vlm(pdf_path, aggregator, abort).await
    }

    /// Render at sampling DPI into a scratch directory and show sampled
    /// pages to the VLM.
    async fn sample_with_vlm(
        &self,
        pdf_path: &Path,
        aggregator: &TokenUsageAggregator,
        abort: &AbortSignal,
    ) -> Result<StrategyDecision> {
        // Dropped on every exit path below, including `?` returns.
        let scratch = tempfile::TempDir::new()
            .map_err(|e| crate::error::HanjadocError::Internal(e.to_string()))?;

        let renderer = PageRenderer::new(&self.config.rasterizer_bin);
        let rendered = renderer
            .render(
                pdf_path,
                scratch.path(),
                RenderOptions {
                    dpi: self.config.sample_dpi,
                },
            )
            .await?;

        let total_pages = rendered.page_count;
        let indices = select_sample_pages(total_pages, self.config.max_sample_pages);
        info!(
            "VLM sampling: {} of {} pages at {} DPI",
            indices.len(),
            total_pages,
            self.config.sample_dpi
        );

        let mut last_languages: Vec<String> = Vec::new();
        let mut sampled = 0usize;

        for idx in indices {
            abort.check()?;
            let page = idx + 1;
            let png = tokio::fs::read(&rendered.page_files[idx]).await.map_err(|e| {
                crate::error::HanjadocError::Internal(format!(
                    "failed to read sample raster for page {}: {}",
                    page, e
                ))
            })?;

            let call = VisionCall {
                schema: prompts::hanja_detection_schema(),
                messages: vec![VisionMessage::user(vec![
                    vision::text_part(prompts::HANJA_DETECTION_PROMPT),
                    vision::png_part(&png),
                ])],
                primary_model: self.config.model.clone(),
                fallback_model: self.config.fallback_model.clone(),
                max_retries: self.config.max_retries,
                temperature: 0.0,
                component: "ocr-strategy-sampler",
                phase: "hanja-detection",
                abort: abort.clone(),
            };

            let response: DetectionResponse =
                vision::call_and_track(self.vision.as_ref(), call, aggregator).await?;
            sampled += 1;

            if response.has_korean_hanja_mix {
                info!("VLM detected Hangul-Hanja mix on page {}", page);
                return Ok(StrategyDecision {
                    method: OcrMethod::Vlm,
                    reason: Some(format!("Korean-Hanja mix detected on page {}", page)),
                    detected_languages: Some(response.detected_languages),
                    hanja_pages: None,
                    sampled_pages: Some(sampled),
                    total_pages: Some(total_pages),
                });
            }
            last_languages = response.detected_languages;
        }

        Ok(StrategyDecision {
            method: OcrMethod::OcrMac,
            reason: None,
            detected_languages: if last_languages.is_empty() {
                None
            } else {
                Some(last_languages)
            },
            hanja_pages: None,
            sampled_pages: Some(sampled),
            total_pages: Some(total_pages),
        })
    }
}
