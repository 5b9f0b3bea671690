//! Integration tests for the VLM pipeline, driven by a scripted mock
//! vision model. No network, no live model; subprocess-backed tests stub
//! the external tools with shell scripts and are unix-only.

use hanjadoc::document::{CanonicalDocument, Label, PageRecord, PageSize};
use hanjadoc::pipeline::corrector::{CorrectorContext, VlmTextCorrector};
use hanjadoc::pipeline::processor::{ProcessContext, VlmPageProcessor};
use hanjadoc::vision::{CallTokens, VisionCall, VisionModel, VisionOutcome};
use hanjadoc::{AbortSignal, HanjadocError, PipelineConfig};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

// ── Mock vision model ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RecordedCall {
    component: &'static str,
    phase: &'static str,
    temperature: f32,
}

/// Pops scripted outputs in call order and records every call.
struct MockVision {
    responses: Mutex<VecDeque<Value>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockVision {
    fn scripted(responses: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl VisionModel for MockVision {
    async fn call_vision(&self, call: VisionCall) -> Result<VisionOutcome, HanjadocError> {
        call.abort.check()?;
        self.calls.lock().unwrap().push(RecordedCall {
            component: call.component,
            phase: call.phase,
            temperature: call.temperature,
        });
        let output = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| HanjadocError::VlmCall {
                component: call.component,
                message: "mock exhausted".to_string(),
            })?;
        Ok(VisionOutcome {
            output,
            tokens: CallTokens {
                input_tokens: 100,
                output_tokens: 40,
            },
            model_name: "mock-vision".to_string(),
            used_fallback: false,
        })
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn config() -> PipelineConfig {
    PipelineConfig::builder().model("mock-vision").build().unwrap()
}

/// Write `count` dummy page rasters and return their paths.
fn fake_pages(dir: &Path, count: usize) -> Vec<PathBuf> {
    let pages_dir = dir.join("pages");
    std::fs::create_dir_all(&pages_dir).unwrap();
    (0..count)
        .map(|i| {
            let path = pages_dir.join(format!("page_{}.png", i));
            std::fs::write(&path, format!("fake png {i}")).unwrap();
            path
        })
        .collect()
}

fn page_element(content: &str, order: u32) -> Value {
    json!({ "t": "tx", "c": content, "o": order })
}

// ── VlmPageProcessor ─────────────────────────────────────────────────────

#[tokio::test]
async fn empty_page_triggers_one_warmer_retry() {
    let dir = tempfile::TempDir::new().unwrap();
    let files = fake_pages(dir.path(), 1);

    let vision = MockVision::scripted(vec![
        json!({ "e": [] }),
        json!({ "e": [page_element("x", 0)] }),
    ]);
    let processor = VlmPageProcessor::new(vision.clone(), config());
    let ctx = ProcessContext::default();

    let results = processor.process_pages(&files, &ctx).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].elements.len(), 1);
    assert_eq!(results[0].elements[0].content, "x");

    // Both calls recorded, with the documented phases and temperatures.
    let calls = vision.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].phase, "page-analysis");
    assert_eq!(calls[0].temperature, 0.0);
    assert_eq!(calls[1].phase, "page-analysis-retry");
    assert_eq!(calls[1].temperature, 0.3);

    // The aggregator holds one usage record per call.
    assert_eq!(ctx.aggregator.records().len(), 2);

    // The retry is visible on the result.
    let quality = results[0].quality.as_ref().unwrap();
    assert!(quality.retried);
    assert!(quality.issues.is_empty());
}

#[tokio::test]
async fn quality_retry_names_the_issues_and_clears_them() {
    let dir = tempfile::TempDir::new().unwrap();
    let files = fake_pages(dir.path(), 1);

    let vision = MockVision::scripted(vec![
        json!({ "e": [page_element("Lorem ipsum dolor sit amet", 0)] }),
        json!({ "e": [page_element("멀쩡한 본문 텍스트", 0)] }),
    ]);
    let processor = VlmPageProcessor::new(vision.clone(), config());
    let ctx = ProcessContext::default();

    let results = processor.process_pages(&files, &ctx).await.unwrap();
    let calls = vision.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].phase, "page-analysis-quality-retry");
    assert_eq!(calls[1].temperature, 0.5);

    let quality = results[0].quality.as_ref().unwrap();
    assert!(quality.retried);
    assert!(quality.issues.is_empty(), "retry output was clean");
    assert_eq!(results[0].elements[0].content, "멀쩡한 본문 텍스트");
}

#[tokio::test]
async fn page_numbers_map_to_input_order_under_concurrency() {
    let dir = tempfile::TempDir::new().unwrap();
    let files = fake_pages(dir.path(), 8);

    let responses = (0..8).map(|i| json!({ "e": [page_element(&format!("p{i}"), 0)] })).collect();
    let vision = MockVision::scripted(responses);
    let config = PipelineConfig::builder()
        .model("mock-vision")
        .concurrency(4)
        .build()
        .unwrap();
    let processor = VlmPageProcessor::new(vision, config);

    let results = processor
        .process_pages(&files, &ProcessContext::default())
        .await
        .unwrap();
    let page_nos: Vec<usize> = results.iter().map(|r| r.page_no).collect();
    assert_eq!(page_nos, (1..=8).collect::<Vec<_>>());
}

#[tokio::test]
async fn on_token_usage_fires_per_page_with_snapshots() {
    let dir = tempfile::TempDir::new().unwrap();
    let files = fake_pages(dir.path(), 3);

    let vision = MockVision::scripted(
        (0..3).map(|_| json!({ "e": [page_element("본문", 0)] })).collect(),
    );
    let processor = VlmPageProcessor::new(vision, config());

    let snapshots: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let snapshots_ref = Arc::clone(&snapshots);
    let ctx = ProcessContext {
        on_token_usage: Some(Arc::new(move |report| {
            snapshots_ref
                .lock()
                .unwrap()
                .push(report.total.total_tokens as usize);
        })),
        ..Default::default()
    };

    processor.process_pages(&files, &ctx).await.unwrap();
    let seen = snapshots.lock().unwrap();
    assert_eq!(seen.len(), 3);
    // Monotonically growing totals.
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*seen.last().unwrap(), 3 * 140);
}

#[tokio::test]
async fn raised_abort_signal_is_fatal() {
    let dir = tempfile::TempDir::new().unwrap();
    let files = fake_pages(dir.path(), 2);

    let vision = MockVision::scripted(vec![]);
    let processor = VlmPageProcessor::new(vision.clone(), config());
    let abort = AbortSignal::new();
    abort.abort();
    let ctx = ProcessContext {
        abort,
        ..Default::default()
    };

    let result = processor.process_pages(&files, &ctx).await;
    assert!(matches!(result, Err(HanjadocError::Aborted)));
    assert_eq!(vision.call_count(), 0);
}

// ── VlmTextCorrector ─────────────────────────────────────────────────────

/// A single-page document with one text item on page 1.
fn seed_correction_document(text: &str) -> CanonicalDocument {
    let mut doc = CanonicalDocument::new("report");
    doc.texts.push(hanjadoc::document::TextItem {
        self_ref: "#/texts/0".to_string(),
        parent: Some(hanjadoc::document::ItemRef::new("#/body")),
        children: Vec::new(),
        label: Label::Text,
        prov: vec![hanjadoc::document::Provenance {
            page_no: 1,
            ..Default::default()
        }],
        orig: text.to_string(),
        text: text.to_string(),
        level: None,
        enumerated: None,
        marker: None,
    });
    doc.body
        .children
        .push(hanjadoc::document::ItemRef::new("#/texts/0"));
    doc.pages.insert(
        "1".to_string(),
        PageRecord {
            page_no: 1,
            size: PageSize {
                width: 100.0,
                height: 100.0,
            },
            ..Default::default()
        },
    );
    doc
}

async fn write_correction_fixture(dir: &Path, text: &str) {
    let doc = seed_correction_document(text);
    doc.save(&dir.join("result.json")).await.unwrap();
    fake_pages(dir, 1);
}

#[tokio::test]
async fn substitution_corrects_text_and_orig() {
    let dir = tempfile::TempDir::new().unwrap();
    write_correction_fixture(dir.path(), "잘못된 遣蹟").await;

    let vision = MockVision::scripted(vec![json!({
        "tc": [{ "i": 0, "s": [{ "f": "遣蹟", "r": "遺蹟" }] }],
        "cc": []
    })]);
    let corrector = VlmTextCorrector::new(vision.clone(), config());

    let summary = corrector
        .correct_and_save(dir.path(), &CorrectorContext::default())
        .await
        .unwrap();
    assert_eq!(summary.text_corrections, 1);
    assert_eq!(summary.cell_corrections, 0);
    assert_eq!(summary.pages_processed, 1);
    assert_eq!(summary.pages_failed, 0);

    let calls = vision.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].component, "vlm-text-corrector");
    assert_eq!(calls[0].phase, "text-correction");

    let doc = CanonicalDocument::load(&dir.path().join("result.json"))
        .await
        .unwrap();
    assert_eq!(doc.texts[0].text, "잘못된 遺蹟");
    assert_eq!(doc.texts[0].orig, "잘못된 遺蹟");
}

#[tokio::test]
async fn second_clean_run_is_byte_identical_and_counts_zero() {
    let dir = tempfile::TempDir::new().unwrap();
    write_correction_fixture(dir.path(), "잘못된 遣蹟").await;

    let vision = MockVision::scripted(vec![
        json!({ "tc": [{ "i": 0, "s": [{ "f": "遣蹟", "r": "遺蹟" }] }], "cc": [] }),
        json!({ "tc": [], "cc": [] }),
    ]);
    let corrector = VlmTextCorrector::new(vision, config());

    corrector
        .correct_and_save(dir.path(), &CorrectorContext::default())
        .await
        .unwrap();
    let after_first = std::fs::read(dir.path().join("result.json")).unwrap();

    let summary = corrector
        .correct_and_save(dir.path(), &CorrectorContext::default())
        .await
        .unwrap();
    assert_eq!(summary.text_corrections, 0);
    assert_eq!(summary.cell_corrections, 0);

    let after_second = std::fs::read(dir.path().join("result.json")).unwrap();
    assert_eq!(after_first, after_second);
}

#[tokio::test]
async fn failed_page_keeps_ocr_text_and_counts() {
    let dir = tempfile::TempDir::new().unwrap();
    write_correction_fixture(dir.path(), "잘못된 遣蹟").await;

    // No scripted responses: the mock fails the call.
    let vision = MockVision::scripted(vec![]);
    let corrector = VlmTextCorrector::new(vision, config());

    let summary = corrector
        .correct_and_save(dir.path(), &CorrectorContext::default())
        .await
        .unwrap();
    assert_eq!(summary.pages_failed, 1);
    assert_eq!(summary.pages_processed, 0);

    let doc = CanonicalDocument::load(&dir.path().join("result.json"))
        .await
        .unwrap();
    assert_eq!(doc.texts[0].text, "잘못된 遣蹟");
}

#[tokio::test]
async fn hanja_pages_filter_restricts_correction() {
    let dir = tempfile::TempDir::new().unwrap();
    write_correction_fixture(dir.path(), "잘못된 遣蹟").await;

    let vision = MockVision::scripted(vec![json!({ "tc": [], "cc": [] })]);
    let corrector = VlmTextCorrector::new(vision.clone(), config());

    // Page 1 is not in the subset, so no call happens.
    let ctx = CorrectorContext {
        hanja_pages: Some(vec![7]),
        ..Default::default()
    };
    let summary = corrector.correct_and_save(dir.path(), &ctx).await.unwrap();
    assert_eq!(summary.pages_processed, 0);
    assert_eq!(vision.call_count(), 0);
}

#[tokio::test]
async fn abort_during_correction_rethrows() {
    let dir = tempfile::TempDir::new().unwrap();
    write_correction_fixture(dir.path(), "잘못된 遣蹟").await;

    let vision = MockVision::scripted(vec![json!({ "tc": [], "cc": [] })]);
    let corrector = VlmTextCorrector::new(vision, config());
    let abort = AbortSignal::new();
    abort.abort();
    let ctx = CorrectorContext {
        abort,
        ..Default::default()
    };

    let result = corrector.correct_and_save(dir.path(), &ctx).await;
    assert!(matches!(result, Err(HanjadocError::Aborted)));
}

// ── OcrStrategySampler (stubbed subprocess tools, unix only) ────────────

#[cfg(unix)]
mod sampler_subprocess {
    use super::*;
    use hanjadoc::pipeline::sampler::OcrStrategySampler;
    use hanjadoc::usage::TokenUsageAggregator;
    use hanjadoc::OcrMethod;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    /// Seed test: a 10-page PDF whose page-4 text layer mixes Hangul and
    /// Hanja decides `vlm` from the text layer alone; the rasteriser is
    /// never invoked.
    #[tokio::test]
    async fn text_layer_precheck_short_circuits_before_rendering() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("rasterizer-invoked");

        let pdfinfo = write_script(dir.path(), "pdfinfo", "echo 'Pages: 10'");
        // pdftotext -f N -l N -layout <pdf> -  → $2 is the first page number.
        let pdftotext = write_script(
            dir.path(),
            "pdftotext",
            "if [ \"$2\" = \"4\" ]; then echo '한글과 發掘 보고서'; else echo '표지 한글'; fi",
        );
        let rasterizer = write_script(
            dir.path(),
            "magick-stub",
            &format!("touch '{}'\nexit 1", marker.display()),
        );

        let config = PipelineConfig::builder()
            .model("mock-vision")
            .pdfinfo_bin(pdfinfo.to_str().unwrap())
            .pdftotext_bin(pdftotext.to_str().unwrap())
            .rasterizer_bin(rasterizer.to_str().unwrap())
            .build()
            .unwrap();

        let vision = MockVision::scripted(vec![]);
        let sampler = OcrStrategySampler::new(vision.clone(), config);
        let aggregator = TokenUsageAggregator::new();

        let decision = sampler
            .sample(Path::new("/tmp/report.pdf"), &aggregator, &AbortSignal::new())
            .await
            .unwrap();

        assert_eq!(decision.method, OcrMethod::Vlm);
        assert!(decision.reason.as_deref().unwrap().contains("page 4"));
        assert_eq!(
            decision.detected_languages,
            Some(vec!["ko-KR".to_string()])
        );
        assert_eq!(decision.hanja_pages, Some(vec![4]));

        assert!(!marker.exists(), "rasteriser must not be invoked");
        assert_eq!(vision.call_count(), 0, "VLM must not be consulted");
    }

    #[tokio::test]
    async fn hangul_only_text_layer_selects_native_ocr() {
        let dir = tempfile::TempDir::new().unwrap();
        let pdfinfo = write_script(dir.path(), "pdfinfo", "echo 'Pages: 6'");
        let pdftotext = write_script(dir.path(), "pdftotext", "echo '순수 한글 보고서'");

        let config = PipelineConfig::builder()
            .model("mock-vision")
            .pdfinfo_bin(pdfinfo.to_str().unwrap())
            .pdftotext_bin(pdftotext.to_str().unwrap())
            .build()
            .unwrap();

        let vision = MockVision::scripted(vec![]);
        let sampler = OcrStrategySampler::new(vision, config);

        let decision = sampler
            .sample(
                Path::new("/tmp/report.pdf"),
                &TokenUsageAggregator::new(),
                &AbortSignal::new(),
            )
            .await
            .unwrap();
        assert_eq!(decision.method, OcrMethod::OcrMac);
        assert_eq!(
            decision.detected_languages,
            Some(vec!["ko-KR".to_string()])
        );
    }
}
