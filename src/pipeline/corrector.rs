//! Second-pass Hanja correction over an assembled document.
//!
//! The first VLM pass transcribes; this pass proofreads. For each page the
//! corrector shows the model three witnesses side by side (the OCR text
//! items, the page image, and, when available, the PDF text layer aligned
//! item-by-item) and asks for *substitutions only*. A substitution list
//! keeps the blast radius of a bad model answer to a few characters; a
//! wholesale rewrite could silently lose whole sentences.
//!
//! ## Reference alignment
//!
//! The text layer arrives as loose blocks with no linkage to OCR items.
//! Blocks are matched to items greedily by character-multiset overlap
//! (`Σ min(freq) / max(|a|,|b|)`, threshold 0.4): crude, but script
//! agnostic and cheap, and a block is consumed at most once so a repeated
//! heading cannot shadow later items. Whatever remains unmatched is handed
//! to the model as `C_REF` context, but only on pages that actually have
//! tables to absorb it.
//!
//! ## Failure policy
//!
//! A failed page keeps its OCR text: the error is logged, `pages_failed`
//! increments, and the document still round-trips. Only a raised abort
//! signal propagates.

use crate::abort::AbortSignal;
use crate::config::PipelineConfig;
use crate::document::{CanonicalDocument, Label};
use crate::error::{HanjadocError, Result};
use crate::pipeline::processor::OnTokenUsage;
use crate::pipeline::textlayer::PageTextLayer;
use crate::prompts;
use crate::usage::TokenUsageAggregator;
use crate::vision::{self, VisionCall, VisionMessage, VisionModel};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Minimum multiset-overlap score for a reference block to count as the
/// same text as an OCR item.
const ALIGN_THRESHOLD: f64 = 0.4;

/// Labels eligible for text correction.
const CORRECTABLE: [Label; 7] = [
    Label::SectionHeader,
    Label::Text,
    Label::Caption,
    Label::Footnote,
    Label::ListItem,
    Label::PageHeader,
    Label::PageFooter,
];

/// Outcome of a correction run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrectionSummary {
    /// Substitutions applied to text items.
    pub text_corrections: usize,
    /// Table cells updated.
    pub cell_corrections: usize,
    pub pages_processed: usize,
    pub pages_failed: usize,
}

/// Per-run context.
#[derive(Clone, Default)]
pub struct CorrectorContext {
    /// Per-page pdftotext reference, aligned against OCR items.
    pub page_texts: PageTextLayer,
    /// Restrict correction to these pages (from the strategy sampler).
    pub hanja_pages: Option<Vec<usize>>,
    pub aggregator: TokenUsageAggregator,
    pub abort: AbortSignal,
    pub on_token_usage: Option<OnTokenUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct Substitution {
    f: String,
    r: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TextCorrection {
    i: usize,
    s: Vec<Substitution>,
}

#[derive(Debug, Clone, Deserialize)]
struct CellCorrection {
    ti: usize,
    r: usize,
    c: usize,
    t: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CorrectionResponse {
    tc: Vec<TextCorrection>,
    cc: Vec<CellCorrection>,
}

/// What happened to one page inside the pool.
enum PageOutcome {
    Corrections(CorrectionResponse),
    /// Nothing on the page to correct; no call made.
    Empty,
    /// VLM call failed; OCR text kept.
    Failed,
}

/// Everything needed to correct one page, captured before the pool runs so
/// the document itself is free for mutation afterwards.
struct PagePlan {
    page_no: usize,
    prompt_body: String,
    has_items: bool,
    raster: std::path::PathBuf,
}

/// Second-pass corrector.
pub struct VlmTextCorrector {
    vision: Arc<dyn VisionModel>,
    config: PipelineConfig,
}

impl VlmTextCorrector {
    pub fn new(vision: Arc<dyn VisionModel>, config: PipelineConfig) -> Self {
        Self { vision, config }
    }

    /// Load `output_dir/result.json`, correct it page by page, and persist
    /// it back to the same path.
    pub async fn correct_and_save(
        &self,
        output_dir: &Path,
        ctx: &CorrectorContext,
    ) -> Result<CorrectionSummary> {
        let doc_path = output_dir.join("result.json");
        let mut doc = CanonicalDocument::load(&doc_path).await?;

        let mut pages = doc.page_numbers();
        if let Some(ref subset) = ctx.hanja_pages {
            pages.retain(|p| subset.contains(p));
        }
        info!("Correcting {} pages of {}", pages.len(), doc_path.display());

        let plans: Vec<PagePlan> = pages
            .iter()
            .map(|&page_no| build_page_plan(&doc, page_no, output_dir, &ctx.page_texts))
            .collect();

        let mut indexed: Vec<(usize, PageOutcome)> =
            futures::stream::iter(plans.iter().enumerate().map(|(idx, plan)| {
                let ctx = ctx.clone();
                async move {
                    let outcome = self.correct_page(plan, &ctx).await;
                    if let Some(ref callback) = ctx.on_token_usage {
                        callback(ctx.aggregator.report());
                    }
                    (idx, outcome)
                }
            }))
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        // Abort is the only failure that propagates out of a page.
        ctx.abort.check()?;

        indexed.sort_by_key(|(idx, _)| *idx);

        let mut summary = CorrectionSummary::default();
        for (_, outcome) in indexed {
            match outcome {
                PageOutcome::Corrections(response) => {
                    summary.pages_processed += 1;
                    summary.text_corrections += apply_text_corrections(&mut doc, &response.tc);
                    summary.cell_corrections += apply_cell_corrections(&mut doc, &response.cc);
                }
                PageOutcome::Empty => summary.pages_processed += 1,
                PageOutcome::Failed => summary.pages_failed += 1,
            }
        }

        doc.save(&doc_path).await?;
        info!(
            "Correction complete: {} text substitutions, {} cell updates, {} pages failed",
            summary.text_corrections, summary.cell_corrections, summary.pages_failed
        );
        Ok(summary)
    }

    /// Run one page through the correction call.
    async fn correct_page(&self, plan: &PagePlan, ctx: &CorrectorContext) -> PageOutcome {
        if !plan.has_items {
            debug!("Page {}: nothing to correct", plan.page_no);
            return PageOutcome::Empty;
        }
        if ctx.abort.is_aborted() {
            return PageOutcome::Failed;
        }

        let png = match tokio::fs::read(&plan.raster).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    "Page {}: raster {} unreadable ({}), keeping OCR text",
                    plan.page_no,
                    plan.raster.display(),
                    e
                );
                return PageOutcome::Failed;
            }
        };

        let mut prompt = String::new();
        if !self.config.document_languages.is_empty() {
            prompt.push_str(&prompts::language_context(&self.config.document_languages));
        }
        prompt.push_str(prompts::CORRECTION_SYSTEM_PROMPT);
        prompt.push_str("\n\n");
        prompt.push_str(&plan.prompt_body);

        let call = VisionCall {
            schema: prompts::correction_schema(),
            messages: vec![VisionMessage::user(vec![
                vision::text_part(prompt),
                vision::png_part(&png),
            ])],
            primary_model: self.config.model.clone(),
            fallback_model: self.config.fallback_model.clone(),
            max_retries: self.config.max_retries,
            temperature: 0.0,
            component: "vlm-text-corrector",
            phase: "text-correction",
            abort: ctx.abort.clone(),
        };

        match vision::call_and_track::<CorrectionResponse>(
            self.vision.as_ref(),
            call,
            &ctx.aggregator,
        )
        .await
        {
            Ok(response) => PageOutcome::Corrections(response),
            Err(HanjadocError::Aborted) => PageOutcome::Failed,
            Err(e) => {
                warn!(
                    "Page {}: correction call failed ({}), keeping OCR text",
                    plan.page_no, e
                );
                PageOutcome::Failed
            }
        }
    }
}

/// Build the prompt body and metadata for one page.
fn build_page_plan(
    doc: &CanonicalDocument,
    page_no: usize,
    output_dir: &Path,
    page_texts: &PageTextLayer,
) -> PagePlan {
    // Page-scoped text items, in document order, with their global index.
    let items: Vec<(usize, &str)> = doc
        .texts
        .iter()
        .enumerate()
        .filter(|(_, item)| {
            item.prov.first().map(|p| p.page_no) == Some(page_no)
                && CORRECTABLE.contains(&item.label)
        })
        .map(|(i, item)| (i, item.text.as_str()))
        .collect();

    // Page-scoped tables, with their global index.
    let tables: Vec<usize> = doc
        .tables
        .iter()
        .enumerate()
        .filter(|(_, table)| table.prov.first().map(|p| p.page_no) == Some(page_no))
        .map(|(ti, _)| ti)
        .collect();

    let mut lines: Vec<String> = Vec::new();

    // Reference alignment against the pdftotext blocks.
    let blocks = page_texts
        .get(&page_no)
        .map(|text| split_reference_blocks(text))
        .unwrap_or_default();
    let alignment = align_references(&items, blocks);

    for (i, text) in &items {
        let label = doc.texts[*i].label;
        lines.push(format!("{}|{}|{}", i, label.code(), text));
        if let Some(block) = alignment.matched.get(i) {
            lines.push(format!("{}|ref|{}", i, block));
        }
    }

    for &ti in &tables {
        for row in &doc.tables[ti].data.grid {
            for cell in row {
                if cell.text.trim().is_empty() {
                    continue;
                }
                lines.push(format!(
                    "{}|{},{}|{}",
                    ti, cell.start_row_offset_idx, cell.start_col_offset_idx, cell.text
                ));
            }
        }
    }

    let mut prompt_body = lines.join("\n");
    if !tables.is_empty() && !alignment.unused.is_empty() {
        prompt_body.push_str("\nC_REF:\n");
        prompt_body.push_str(&alignment.unused.join("\n"));
    }

    let has_items = !lines.is_empty();
    PagePlan {
        page_no,
        prompt_body,
        has_items,
        raster: output_dir.join(format!("pages/page_{}.png", page_no.saturating_sub(1))),
    }
}

// ── Reference alignment ──────────────────────────────────────────────────

/// Split a pdftotext page into blocks at blank lines. Lines within a block
/// are joined with single spaces and internal whitespace runs collapsed,
/// so layout padding cannot dominate the character multiset.
pub fn split_reference_blocks(page_text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in page_text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                blocks.push(join_block(&current));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        blocks.push(join_block(&current));
    }
    blocks
}

fn join_block(lines: &[&str]) -> String {
    lines
        .iter()
        .flat_map(|line| line.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Character-multiset overlap: `Σ_c min(freqA[c], freqB[c]) / max(|a|,|b|)`.
///
/// Script-agnostic and position-blind; 0.4 is the empirical threshold below
/// which pdftotext blocks and OCR items stop being the same text.
pub fn char_multiset_overlap(a: &str, b: &str) -> f64 {
    let len_a = a.chars().count();
    let len_b = b.chars().count();
    let denom = len_a.max(len_b);
    if denom == 0 {
        return 0.0;
    }

    let mut freq_a: HashMap<char, usize> = HashMap::new();
    for c in a.chars() {
        *freq_a.entry(c).or_default() += 1;
    }
    let mut freq_b: HashMap<char, usize> = HashMap::new();
    for c in b.chars() {
        *freq_b.entry(c).or_default() += 1;
    }

    let overlap: usize = freq_a
        .iter()
        .map(|(c, &count)| count.min(freq_b.get(c).copied().unwrap_or(0)))
        .sum();

    overlap as f64 / denom as f64
}

struct Alignment {
    /// item index → matched (but not byte-identical) reference block.
    matched: HashMap<usize, String>,
    /// Blocks no item claimed, in original order.
    unused: Vec<String>,
}

/// Greedily match reference blocks to OCR items in item order. Each block
/// is consumed at most once; identical matches are consumed but produce no
/// `|ref|` line.
fn align_references(items: &[(usize, &str)], blocks: Vec<String>) -> Alignment {
    let mut available: Vec<Option<String>> = blocks.into_iter().map(Some).collect();
    let mut matched = HashMap::new();

    for (i, text) in items {
        let mut best: Option<(usize, f64)> = None;
        for (slot, block) in available.iter().enumerate() {
            if let Some(block) = block {
                let score = char_multiset_overlap(text, block);
                if best.map(|(_, s)| score > s).unwrap_or(true) {
                    best = Some((slot, score));
                }
            }
        }
        if let Some((slot, score)) = best {
            if score >= ALIGN_THRESHOLD {
                let block = available[slot].take().expect("slot was Some");
                if block != *text {
                    matched.insert(*i, block);
                }
            }
        }
    }

    Alignment {
        matched,
        unused: available.into_iter().flatten().collect(),
    }
}

// ── Applying corrections ─────────────────────────────────────────────────

/// Apply text substitutions; returns the number applied.
///
/// Each substitution replaces the first occurrence of `f`. A missing `f`
/// skips that single substitution; the rest of the item's list proceeds.
fn apply_text_corrections(doc: &mut CanonicalDocument, corrections: &[TextCorrection]) -> usize {
    let mut applied = 0usize;
    for correction in corrections {
        let Some(item) = doc.texts.get_mut(correction.i) else {
            warn!("Text correction for missing item index {}", correction.i);
            continue;
        };
        let mut value = item.text.clone();
        for sub in &correction.s {
            match value.find(&sub.f) {
                Some(pos) => {
                    value.replace_range(pos..pos + sub.f.len(), &sub.r);
                    applied += 1;
                }
                None => {
                    warn!(
                        "Substitution source '{}' not found in text item {}",
                        sub.f, correction.i
                    );
                }
            }
        }
        item.text = value.clone();
        item.orig = value;
    }
    applied
}

/// Apply cell corrections to both `table_cells` and `grid`; returns the
/// number of cells updated. Missing tables, rows, or cells are skipped.
fn apply_cell_corrections(doc: &mut CanonicalDocument, corrections: &[CellCorrection]) -> usize {
    let mut applied = 0usize;
    for correction in corrections {
        let Some(table) = doc.tables.get_mut(correction.ti) else {
            warn!("Cell correction for missing table index {}", correction.ti);
            continue;
        };

        let mut updated = false;
        if let Some(cell) = table.data.table_cells.iter_mut().find(|cell| {
            cell.start_row_offset_idx == correction.r && cell.start_col_offset_idx == correction.c
        }) {
            cell.text = correction.t.clone();
            updated = true;
        }
        if let Some(cell) = table
            .data
            .grid
            .get_mut(correction.r)
            .and_then(|row| row.get_mut(correction.c))
        {
            cell.text = correction.t.clone();
            updated = true;
        }

        if updated {
            applied += 1;
        } else {
            warn!(
                "Cell correction ({}, {}, {}) matched nothing",
                correction.ti, correction.r, correction.c
            );
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ItemRef, Provenance, TableCell, TableData, TableItem, TextItem};

    fn text_item(index: usize, page_no: usize, label: Label, text: &str) -> TextItem {
        TextItem {
            self_ref: format!("#/texts/{}", index),
            parent: Some(ItemRef::new("#/body")),
            children: Vec::new(),
            label,
            prov: vec![Provenance {
                page_no,
                ..Default::default()
            }],
            orig: text.to_string(),
            text: text.to_string(),
            level: None,
            enumerated: None,
            marker: None,
        }
    }

    fn doc_with_text(page_no: usize, texts: &[(Label, &str)]) -> CanonicalDocument {
        let mut doc = CanonicalDocument::new("t");
        for (i, (label, text)) in texts.iter().enumerate() {
            doc.texts.push(text_item(i, page_no, *label, text));
        }
        doc
    }

    #[test]
    fn overlap_is_one_for_identical_strings() {
        assert_eq!(char_multiset_overlap("발굴조사", "발굴조사"), 1.0);
    }

    #[test]
    fn overlap_is_zero_for_disjoint_strings() {
        assert_eq!(char_multiset_overlap("가나다", "xyz"), 0.0);
        assert_eq!(char_multiset_overlap("", ""), 0.0);
    }

    #[test]
    fn overlap_is_order_insensitive() {
        let forward = char_multiset_overlap("발굴조사 보고서", "보고서 발굴조사");
        assert_eq!(forward, 1.0);
    }

    #[test]
    fn overlap_penalises_length_mismatch() {
        // 4 shared chars out of max(4, 12).
        let score = char_multiset_overlap("발굴조사", "발굴조사에 대한 보고서다");
        assert!(score < 0.4, "got {score}");
    }

    #[test]
    fn blocks_split_on_blank_lines_and_collapse_whitespace() {
        let text = "제1장   서론\n조사  개요\n\n\n제2장 본론\n";
        let blocks = split_reference_blocks(text);
        assert_eq!(blocks, vec!["제1장 서론 조사 개요", "제2장 본론"]);
    }

    #[test]
    fn empty_page_text_yields_no_blocks() {
        assert!(split_reference_blocks("").is_empty());
        assert!(split_reference_blocks("  \n \n").is_empty());
    }

    #[test]
    fn alignment_consumes_each_block_once() {
        let items = vec![(0usize, "경주 월성 발굴조사"), (1, "경주 월성 발굴조사")];
        let blocks = vec!["경주 월성 발굴조사 縣".to_string()];
        let alignment = align_references(&items, blocks);
        // Only the first item claims the single block.
        assert!(alignment.matched.contains_key(&0));
        assert!(!alignment.matched.contains_key(&1));
        assert!(alignment.unused.is_empty());
    }

    #[test]
    fn identical_block_is_consumed_without_ref_line() {
        let items = vec![(0usize, "경주 월성 발굴조사")];
        let blocks = vec!["경주 월성 발굴조사".to_string()];
        let alignment = align_references(&items, blocks);
        assert!(alignment.matched.is_empty());
        assert!(alignment.unused.is_empty());
    }

    #[test]
    fn low_overlap_blocks_stay_unused() {
        let items = vec![(0usize, "경주 월성 발굴조사")];
        let blocks = vec!["completely unrelated latin text".to_string()];
        let alignment = align_references(&items, blocks);
        assert!(alignment.matched.is_empty());
        assert_eq!(alignment.unused.len(), 1);
    }

    #[test]
    fn substitution_replaces_first_occurrence_and_syncs_orig() {
        let mut doc = doc_with_text(1, &[(Label::Text, "잘못된 遣蹟")]);
        let applied = apply_text_corrections(
            &mut doc,
            &[TextCorrection {
                i: 0,
                s: vec![Substitution {
                    f: "遣蹟".to_string(),
                    r: "遺蹟".to_string(),
                }],
            }],
        );
        assert_eq!(applied, 1);
        assert_eq!(doc.texts[0].text, "잘못된 遺蹟");
        assert_eq!(doc.texts[0].orig, "잘못된 遺蹟");
    }

    #[test]
    fn missing_fragment_skips_only_that_substitution() {
        let mut doc = doc_with_text(1, &[(Label::Text, "청동기 유물과 遣蹟")]);
        let applied = apply_text_corrections(
            &mut doc,
            &[TextCorrection {
                i: 0,
                s: vec![
                    Substitution {
                        f: "없는조각".to_string(),
                        r: "x".to_string(),
                    },
                    Substitution {
                        f: "遣蹟".to_string(),
                        r: "遺蹟".to_string(),
                    },
                ],
            }],
        );
        assert_eq!(applied, 1);
        assert_eq!(doc.texts[0].text, "청동기 유물과 遺蹟");
    }

    #[test]
    fn cell_corrections_update_both_views() {
        let mut doc = CanonicalDocument::new("t");
        let cell = TableCell::new("遣蹟", 0, 1);
        doc.tables.push(TableItem {
            self_ref: "#/tables/0".to_string(),
            parent: Some(ItemRef::new("#/body")),
            children: Vec::new(),
            label: Label::Table,
            prov: vec![Provenance {
                page_no: 1,
                ..Default::default()
            }],
            captions: Vec::new(),
            references: Vec::new(),
            footnotes: Vec::new(),
            data: TableData {
                table_cells: vec![TableCell::new("유구", 0, 0), cell.clone()],
                grid: vec![vec![TableCell::new("유구", 0, 0), cell]],
                num_rows: 1,
                num_cols: 2,
            },
        });

        let applied = apply_cell_corrections(
            &mut doc,
            &[CellCorrection {
                ti: 0,
                r: 0,
                c: 1,
                t: "遺蹟".to_string(),
            }],
        );
        assert_eq!(applied, 1);
        assert_eq!(doc.tables[0].data.table_cells[1].text, "遺蹟");
        assert_eq!(doc.tables[0].data.grid[0][1].text, "遺蹟");
    }

    #[test]
    fn out_of_range_corrections_are_skipped() {
        let mut doc = doc_with_text(1, &[(Label::Text, "본문")]);
        let applied = apply_text_corrections(
            &mut doc,
            &[TextCorrection {
                i: 99,
                s: vec![Substitution {
                    f: "a".to_string(),
                    r: "b".to_string(),
                }],
            }],
        );
        assert_eq!(applied, 0);
        let cells = apply_cell_corrections(
            &mut doc,
            &[CellCorrection {
                ti: 0,
                r: 0,
                c: 0,
                t: "x".to_string(),
            }],
        );
        assert_eq!(cells, 0);
    }

    #[test]
    fn plan_emits_item_ref_and_cell_lines() {
        let mut doc = doc_with_text(
            2,
            &[
                (Label::SectionHeader, "第一章 調査槪要"),
                (Label::Text, "유적은 경주에 위치한다"),
            ],
        );
        doc.tables.push(TableItem {
            self_ref: "#/tables/0".to_string(),
            parent: Some(ItemRef::new("#/body")),
            children: Vec::new(),
            label: Label::Table,
            prov: vec![Provenance {
                page_no: 2,
                ..Default::default()
            }],
            captions: Vec::new(),
            references: Vec::new(),
            footnotes: Vec::new(),
            data: TableData {
                table_cells: vec![TableCell::new("주거지", 0, 0), TableCell::new("", 0, 1)],
                grid: vec![vec![TableCell::new("주거지", 0, 0), TableCell::new("", 0, 1)]],
                num_rows: 1,
                num_cols: 2,
            },
        });

        let mut page_texts = PageTextLayer::new();
        // First block aligns with item 0 but differs; second block is
        // unclaimed and must surface under C_REF (the page has a table).
        page_texts.insert(
            2,
            "第一章 調査概要\n\n완전히 다른 잔여 블록입니다\n".to_string(),
        );

        let plan = build_page_plan(&doc, 2, Path::new("/out"), &page_texts);
        assert!(plan.has_items);
        let lines: Vec<&str> = plan.prompt_body.lines().collect();
        assert_eq!(lines[0], "0|sh|第一章 調査槪要");
        assert_eq!(lines[1], "0|ref|第一章 調査概要");
        assert!(lines.contains(&"0|0,0|주거지"));
        // Empty cell skipped.
        assert!(!lines.iter().any(|l| l.ends_with("|0,1|")));
        assert!(plan.prompt_body.contains("C_REF:\n완전히 다른 잔여 블록입니다"));
    }

    #[test]
    fn c_ref_omitted_without_tables() {
        let doc = doc_with_text(1, &[(Label::Text, "본문 텍스트")]);
        let mut page_texts = PageTextLayer::new();
        page_texts.insert(1, "매칭되지 않는 영어 not matching at all\n".to_string());
        let plan = build_page_plan(&doc, 1, Path::new("/out"), &page_texts);
        assert!(!plan.prompt_body.contains("C_REF:"));
    }

    #[test]
    fn empty_reference_contributes_nothing() {
        let doc = doc_with_text(1, &[(Label::Text, "본문 텍스트")]);
        let plan = build_page_plan(&doc, 1, Path::new("/out"), &PageTextLayer::new());
        assert!(!plan.prompt_body.contains("|ref|"));
        assert!(!plan.prompt_body.contains("C_REF:"));
    }
}
