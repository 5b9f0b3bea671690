//! Chapter conversion: map a canonical document against a table of
//! contents into a chapter tree with page-range-based resource assignment.
//!
//! The TOC gives each chapter a starting page; a chapter's territory runs
//! from its own page to the page before the next chapter's start, with the
//! last chapter extending to infinity. Content lands in the chapter with
//! the **largest** start page still covering it (the "start-page first"
//! rule); when two chapters share a start page, the earlier one gets an
//! inverted, empty range and receives nothing. Source data exercises this
//! and expects no redistribution.
//!
//! Everything before the first TOC page belongs to the synthetic Front
//! Matter chapter (`ch-000`): covers, prefaces, and the contents pages
//! themselves.
//!
//! A `PageRangeMap` accommodates double-sided scans where one rasterised
//! page holds two document pages: a pdf page maps to its
//! `[startPageNo, endPageNo]` span and content is assigned by the span's
//! start.

use crate::document::{CanonicalDocument, Label};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// A validated table-of-contents entry. Produced by an external extractor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TocEntry {
    pub title: String,
    pub level: u32,
    pub page_no: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TocEntry>,
}

/// One text block inside a chapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextBlock {
    pub text: String,
    pub pdf_page_no: usize,
}

/// A chapter with its assigned content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub id: String,
    /// TOC title exactly as extracted.
    pub origin_title: String,
    /// Whitespace-normalised title.
    pub title: String,
    pub page_no: usize,
    pub level: u32,
    pub text_blocks: Vec<TextBlock>,
    pub image_ids: Vec<String>,
    pub table_ids: Vec<String>,
    pub footnote_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<Chapter>>,
}

/// Reserved id of the synthetic Front Matter chapter.
pub const FRONT_MATTER_ID: &str = "ch-000";

/// Document-page span covered by one rasterised pdf page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSpan {
    pub start_page_no: usize,
    pub end_page_no: usize,
}

/// pdf page number → document-page span. Missing entries fall back to the
/// identity mapping.
pub type PageRangeMap = BTreeMap<usize, PageSpan>;

/// A page-addressed resource (image, table, or footnote) awaiting chapter
/// assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceItem {
    pub id: String,
    pub pdf_page_no: usize,
}

// ── Extraction from the canonical document ───────────────────────────────

/// Collapse whitespace runs and trim.
fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A text survives chapter conversion when it has content beyond bare
/// digits (page numbers masquerading as body text are dropped).
fn is_valid_text(text: &str) -> bool {
    let trimmed = text.trim();
    !trimmed.is_empty() && !trimmed.chars().all(|c| c.is_ascii_digit())
}

/// Pull chapter-eligible text blocks out of the document: body text,
/// section headers, and list items, excluding anything hanging under a
/// picture.
pub fn extract_text_blocks(doc: &CanonicalDocument) -> Vec<TextBlock> {
    doc.texts
        .iter()
        .filter(|item| {
            matches!(item.label, Label::Text | Label::SectionHeader | Label::ListItem)
        })
        .filter(|item| {
            !item
                .parent
                .as_ref()
                .map(|p| p.reference.starts_with("#/pictures/"))
                .unwrap_or(false)
        })
        .filter(|item| is_valid_text(&item.text))
        .map(|item| TextBlock {
            text: normalize_text(&item.text),
            pdf_page_no: item.prov.first().map(|p| p.page_no).unwrap_or(1),
        })
        .collect()
}

/// Stream-ordered resource ids: `img-001…`, `tbl-001…`, `fn-001…`.
pub fn extract_resources(
    doc: &CanonicalDocument,
) -> (Vec<ResourceItem>, Vec<ResourceItem>, Vec<ResourceItem>) {
    let images = doc
        .pictures
        .iter()
        .enumerate()
        .map(|(i, p)| ResourceItem {
            id: format!("img-{:03}", i + 1),
            pdf_page_no: p.prov.first().map(|pr| pr.page_no).unwrap_or(1),
        })
        .collect();
    let tables = doc
        .tables
        .iter()
        .enumerate()
        .map(|(i, t)| ResourceItem {
            id: format!("tbl-{:03}", i + 1),
            pdf_page_no: t.prov.first().map(|pr| pr.page_no).unwrap_or(1),
        })
        .collect();
    let footnotes = doc
        .texts
        .iter()
        .filter(|t| t.label == Label::Footnote)
        .enumerate()
        .map(|(i, t)| ResourceItem {
            id: format!("fn-{:03}", i + 1),
            pdf_page_no: t.prov.first().map(|pr| pr.page_no).unwrap_or(1),
        })
        .collect();
    (images, tables, footnotes)
}

// ── Chapter tree construction ────────────────────────────────────────────

struct ChapterNode {
    chapter: Chapter,
    parent: Option<usize>,
    /// TOC page; Front Matter keeps 0 and never enters range sorting.
    toc_page: usize,
}

/// Build the flat chapter arena: Front Matter at index 0, then the TOC
/// tree in pre-order with monotonically assigned ids.
fn build_nodes(toc: &[TocEntry]) -> Vec<ChapterNode> {
    let mut nodes = vec![ChapterNode {
        chapter: Chapter {
            id: FRONT_MATTER_ID.to_string(),
            origin_title: "Front Matter".to_string(),
            title: "Front Matter".to_string(),
            page_no: 1,
            level: 1,
            text_blocks: Vec::new(),
            image_ids: Vec::new(),
            table_ids: Vec::new(),
            footnote_ids: Vec::new(),
            children: None,
        },
        parent: None,
        toc_page: 0,
    }];

    fn add(nodes: &mut Vec<ChapterNode>, entry: &TocEntry, parent: Option<usize>, next_id: &mut usize) {
        let idx = nodes.len();
        nodes.push(ChapterNode {
            chapter: Chapter {
                id: format!("ch-{:03}", *next_id),
                origin_title: entry.title.clone(),
                title: normalize_text(&entry.title),
                page_no: entry.page_no,
                level: entry.level,
                text_blocks: Vec::new(),
                image_ids: Vec::new(),
                table_ids: Vec::new(),
                footnote_ids: Vec::new(),
                children: None,
            },
            parent,
            toc_page: entry.page_no,
        });
        *next_id += 1;
        for child in &entry.children {
            add(nodes, child, Some(idx), next_id);
        }
    }

    let mut next_id = 1usize;
    for entry in toc {
        add(&mut nodes, entry, None, &mut next_id);
    }
    nodes
}

/// Closed page interval owned by one chapter node.
#[derive(Debug, Clone, Copy)]
struct ChapterRange {
    node: usize,
    start: usize,
    /// `usize::MAX` stands in for the open end of the last chapter.
    end: usize,
}

/// Compute actual page ranges for every node, Front Matter included.
fn compute_ranges(nodes: &[ChapterNode]) -> Vec<ChapterRange> {
    // Flatten real chapters preserving pre-order, then sort by TOC page.
    // The sort is stable, so same-page chapters keep document order and
    // the earlier one ends up with an inverted (empty) range.
    let mut flat: Vec<(usize, usize)> = nodes
        .iter()
        .enumerate()
        .skip(1)
        .map(|(idx, node)| (idx, node.toc_page))
        .collect();
    flat.sort_by_key(|(_, page)| *page);

    let first_toc_page = flat.first().map(|(_, page)| *page);

    let mut ranges = vec![ChapterRange {
        node: 0,
        start: 1,
        end: first_toc_page.map(|p| p.saturating_sub(1)).unwrap_or(usize::MAX),
    }];

    for (pos, (idx, page)) in flat.iter().enumerate() {
        let end = flat
            .get(pos + 1)
            .map(|(_, next)| next.saturating_sub(1))
            .unwrap_or(usize::MAX);
        ranges.push(ChapterRange {
            node: *idx,
            start: *page,
            end,
        });
    }
    ranges
}

/// Map a pdf page to its actual document page.
fn actual_page(page_range_map: &PageRangeMap, pdf_page_no: usize) -> usize {
    page_range_map
        .get(&pdf_page_no)
        .map(|span| span.start_page_no)
        .unwrap_or(pdf_page_no)
}

/// Start-page-first lookup: the containing range with the largest start.
fn find_chapter(ranges: &[ChapterRange], page: usize) -> Option<usize> {
    ranges
        .iter()
        .filter(|r| r.start <= page && page <= r.end)
        .max_by_key(|r| r.start)
        .map(|r| r.node)
}

/// Reassemble the nested tree out of the arena, consuming it.
///
/// Nodes are drained in reverse so children are attached before their
/// parent moves.
fn into_tree(mut nodes: Vec<ChapterNode>) -> Vec<Chapter> {
    let mut children_of: Vec<Vec<Chapter>> = (0..nodes.len()).map(|_| Vec::new()).collect();

    for idx in (0..nodes.len()).rev() {
        let collected = std::mem::take(&mut children_of[idx]);
        if !collected.is_empty() {
            nodes[idx].chapter.children = Some(collected);
        }
        if let Some(parent) = nodes[idx].parent {
            // Reverse drain: prepend to keep document order.
            children_of[parent].insert(0, nodes[idx].chapter.clone());
        }
    }

    let mut roots = Vec::new();
    for node in nodes.into_iter() {
        if node.parent.is_none() {
            roots.push(node.chapter);
        }
    }
    roots
}

/// Build the chapter tree and assign content streams to chapters.
///
/// Input streams keep their order inside each chapter; every valid item
/// lands in exactly one chapter.
pub fn build_chapters(
    toc: &[TocEntry],
    text_blocks: Vec<TextBlock>,
    images: Vec<ResourceItem>,
    tables: Vec<ResourceItem>,
    footnotes: Vec<ResourceItem>,
    page_range_map: &PageRangeMap,
) -> Vec<Chapter> {
    let mut nodes = build_nodes(toc);
    let ranges = compute_ranges(&nodes);
    debug!(
        "Chapter conversion: {} chapters (+ Front Matter), {} text blocks",
        nodes.len() - 1,
        text_blocks.len()
    );

    for block in text_blocks {
        let page = actual_page(page_range_map, block.pdf_page_no);
        if let Some(node) = find_chapter(&ranges, page) {
            nodes[node].chapter.text_blocks.push(block);
        }
    }
    for image in images {
        let page = actual_page(page_range_map, image.pdf_page_no);
        if let Some(node) = find_chapter(&ranges, page) {
            nodes[node].chapter.image_ids.push(image.id);
        }
    }
    for table in tables {
        let page = actual_page(page_range_map, table.pdf_page_no);
        if let Some(node) = find_chapter(&ranges, page) {
            nodes[node].chapter.table_ids.push(table.id);
        }
    }
    for footnote in footnotes {
        let page = actual_page(page_range_map, footnote.pdf_page_no);
        if let Some(node) = find_chapter(&ranges, page) {
            nodes[node].chapter.footnote_ids.push(footnote.id);
        }
    }

    into_tree(nodes)
}

/// Convert an assembled document against its TOC.
pub fn convert_chapters(
    doc: &CanonicalDocument,
    toc: &[TocEntry],
    page_range_map: &PageRangeMap,
) -> Vec<Chapter> {
    let text_blocks = extract_text_blocks(doc);
    let (images, tables, footnotes) = extract_resources(doc);
    build_chapters(toc, text_blocks, images, tables, footnotes, page_range_map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toc_entry(title: &str, level: u32, page_no: usize, children: Vec<TocEntry>) -> TocEntry {
        TocEntry {
            title: title.to_string(),
            level,
            page_no,
            children,
        }
    }

    fn block(page: usize) -> TextBlock {
        TextBlock {
            text: format!("page {page} text"),
            pdf_page_no: page,
        }
    }

    fn resource(id: &str, page: usize) -> ResourceItem {
        ResourceItem {
            id: id.to_string(),
            pdf_page_no: page,
        }
    }

    fn flatten<'a>(chapters: &'a [Chapter], out: &mut Vec<&'a Chapter>) {
        for ch in chapters {
            out.push(ch);
            if let Some(ref children) = ch.children {
                flatten(children, out);
            }
        }
    }

    fn find<'a>(chapters: &'a [Chapter], title: &str) -> &'a Chapter {
        let mut all = Vec::new();
        flatten(chapters, &mut all);
        all.into_iter()
            .find(|c| c.title == title)
            .unwrap_or_else(|| panic!("chapter '{title}' not found"))
    }

    #[test]
    fn page_range_assignment_uses_start_page_first() {
        // TOC: Intro page 1, Body page 10; text on pdf pages 5, 10, 15.
        let toc = vec![
            toc_entry("Intro", 1, 1, vec![]),
            toc_entry("Body", 1, 10, vec![]),
        ];
        let chapters = build_chapters(
            &toc,
            vec![block(5), block(10), block(15)],
            vec![],
            vec![],
            vec![],
            &PageRangeMap::new(),
        );

        let front = find(&chapters, "Front Matter");
        assert!(front.text_blocks.is_empty());
        let intro = find(&chapters, "Intro");
        assert_eq!(intro.text_blocks.len(), 1);
        assert_eq!(intro.text_blocks[0].pdf_page_no, 5);
        let body = find(&chapters, "Body");
        let pages: Vec<usize> = body.text_blocks.iter().map(|b| b.pdf_page_no).collect();
        assert_eq!(pages, vec![10, 15]);
    }

    #[test]
    fn nested_chapters_receive_images_by_range() {
        let toc = vec![
            toc_entry(
                "Ch1",
                1,
                1,
                vec![
                    toc_entry("Sec1.1", 2, 3, vec![]),
                    toc_entry("Sec1.2", 2, 6, vec![]),
                ],
            ),
            toc_entry("Ch2", 1, 10, vec![]),
        ];
        let images = vec![
            resource("img-001", 2),
            resource("img-002", 4),
            resource("img-003", 7),
            resource("img-004", 12),
        ];
        let chapters = build_chapters(&toc, vec![], images, vec![], vec![], &PageRangeMap::new());

        assert_eq!(find(&chapters, "Ch1").image_ids, vec!["img-001"]);
        assert_eq!(find(&chapters, "Sec1.1").image_ids, vec!["img-002"]);
        assert_eq!(find(&chapters, "Sec1.2").image_ids, vec!["img-003"]);
        assert_eq!(find(&chapters, "Ch2").image_ids, vec!["img-004"]);
    }

    #[test]
    fn double_sided_scan_maps_through_page_spans() {
        let toc = vec![
            toc_entry("Ch1", 1, 1, vec![]),
            toc_entry("Ch2", 1, 5, vec![]),
        ];
        let mut map = PageRangeMap::new();
        map.insert(1, PageSpan { start_page_no: 1, end_page_no: 2 });
        map.insert(2, PageSpan { start_page_no: 3, end_page_no: 4 });
        map.insert(3, PageSpan { start_page_no: 5, end_page_no: 6 });

        let chapters = build_chapters(
            &toc,
            vec![block(1), block(2), block(3)],
            vec![],
            vec![],
            vec![],
            &map,
        );
        assert_eq!(find(&chapters, "Ch1").text_blocks.len(), 2);
        assert_eq!(find(&chapters, "Ch2").text_blocks.len(), 1);
    }

    #[test]
    fn empty_toc_routes_everything_to_front_matter() {
        let chapters = build_chapters(
            &[],
            vec![block(1), block(50)],
            vec![resource("img-001", 7)],
            vec![],
            vec![],
            &PageRangeMap::new(),
        );
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].id, FRONT_MATTER_ID);
        assert_eq!(chapters[0].text_blocks.len(), 2);
        assert_eq!(chapters[0].image_ids, vec!["img-001"]);
    }

    #[test]
    fn shared_toc_page_starves_the_earlier_chapter() {
        let toc = vec![
            toc_entry("A", 1, 5, vec![]),
            toc_entry("B", 1, 5, vec![]),
        ];
        let chapters = build_chapters(
            &toc,
            vec![block(5), block(6)],
            vec![],
            vec![],
            vec![],
            &PageRangeMap::new(),
        );
        assert!(find(&chapters, "A").text_blocks.is_empty());
        assert_eq!(find(&chapters, "B").text_blocks.len(), 2);
    }

    #[test]
    fn ids_are_unique_and_front_matter_is_reserved() {
        let toc = vec![
            toc_entry(
                "Ch1",
                1,
                1,
                vec![toc_entry("Sec", 2, 2, vec![toc_entry("Sub", 3, 3, vec![])])],
            ),
            toc_entry("Ch2", 1, 9, vec![]),
        ];
        let chapters = build_chapters(&toc, vec![], vec![], vec![], vec![], &PageRangeMap::new());

        let mut all = Vec::new();
        flatten(&chapters, &mut all);
        let mut ids: Vec<&str> = all.iter().map(|c| c.id.as_str()).collect();
        assert!(ids.contains(&FRONT_MATTER_ID));
        let len_before = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), len_before, "chapter ids must be unique");
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn no_content_is_lost_or_duplicated() {
        let toc = vec![
            toc_entry("Ch1", 1, 2, vec![]),
            toc_entry("Ch2", 1, 8, vec![]),
        ];
        let blocks: Vec<TextBlock> = (1..=12).map(block).collect();
        let chapters = build_chapters(&toc, blocks, vec![], vec![], vec![], &PageRangeMap::new());

        let mut all = Vec::new();
        flatten(&chapters, &mut all);
        let total: usize = all.iter().map(|c| c.text_blocks.len()).sum();
        assert_eq!(total, 12);
        // Page 1 lands in Front Matter.
        assert_eq!(find(&chapters, "Front Matter").text_blocks.len(), 1);
    }

    #[test]
    fn titles_are_normalised_and_origin_preserved() {
        let toc = vec![toc_entry("  第一章 \t 序論  ", 1, 1, vec![])];
        let chapters = build_chapters(&toc, vec![], vec![], vec![], vec![], &PageRangeMap::new());
        let ch = &chapters[1];
        assert_eq!(ch.title, "第一章 序論");
        assert_eq!(ch.origin_title, "  第一章 \t 序論  ");
    }

    #[test]
    fn tree_shape_survives_round_trip() {
        let toc = vec![toc_entry(
            "Ch1",
            1,
            1,
            vec![toc_entry("Sec1.1", 2, 3, vec![]), toc_entry("Sec1.2", 2, 6, vec![])],
        )];
        let chapters = build_chapters(&toc, vec![], vec![], vec![], vec![], &PageRangeMap::new());
        assert_eq!(chapters.len(), 2); // Front Matter + Ch1
        let ch1 = &chapters[1];
        let children = ch1.children.as_ref().unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].title, "Sec1.1");
        assert_eq!(children[1].title, "Sec1.2");
        assert!(children[0].children.is_none());
    }

    #[test]
    fn text_validity_filter() {
        assert!(is_valid_text("유적 개요"));
        assert!(!is_valid_text("   "));
        assert!(!is_valid_text("123"));
        assert!(is_valid_text("123호 주거지"));
    }

    #[test]
    fn chapter_serialises_camel_case() {
        let chapters = build_chapters(
            &[toc_entry("Ch1", 1, 1, vec![])],
            vec![],
            vec![],
            vec![],
            vec![],
            &PageRangeMap::new(),
        );
        let json = serde_json::to_value(&chapters[1]).unwrap();
        assert!(json.get("originTitle").is_some());
        assert!(json.get("pageNo").is_some());
        assert!(json.get("textBlocks").is_some());
        assert!(json.get("imageIds").is_some());
        assert!(json.get("children").is_none());
    }
}
