//! Document assembly: fold per-page VLM elements into the canonical
//! document.
//!
//! This is a pure transformation: no I/O, no model calls. Pages are
//! sorted by number and elements by reading order first, so every
//! traversal-order decision downstream (body children, caption linking,
//! chapter conversion) inherits a deterministic ordering.
//!
//! Coordinate conversion happens here, exactly once: the VLM's normalised
//! top-left boxes become absolute pixel boxes with a bottom-left origin
//! (`l·W, r·W, (1−t)·H, (1−b)·H`). Elements without a box, or on pages
//! with unknown dimensions, get a zero box that still carries the
//! BOTTOMLEFT marker.

use crate::document::{
    CanonicalDocument, CoordOrigin, DocBBox, ImageRecord, ItemRef, Label, PageRecord, PageSize,
    PictureItem, Provenance, TableCell, TableData, TableItem, TextItem, VlmBBox, VlmPageResult,
};
use crate::error::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

/// Metadata the assembler needs alongside the page results.
#[derive(Debug, Clone, Default)]
pub struct AssembleMetadata {
    /// Document name stamped into the canonical document.
    pub name: String,
    /// DPI the pipeline actually rendered at.
    pub dpi: u32,
    /// Pixel dimensions per 1-based page number.
    pub page_dimensions: BTreeMap<usize, PageSize>,
}

static ENUMERATED_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+[.)]").unwrap());

/// Cell separator for whitespace-delimited table pass-through.
static CELL_SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\t|\s{2,}").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TraceKind {
    Picture,
    Table,
    Caption,
    Other,
}

struct TraceEntry {
    page_no: usize,
    self_ref: String,
    kind: TraceKind,
}

/// Assemble page results into a canonical document.
pub fn assemble(results: &[VlmPageResult], meta: &AssembleMetadata) -> CanonicalDocument {
    let mut doc = CanonicalDocument::new(meta.name.clone());

    // Pages sorted by number, elements by reading order.
    let mut pages: Vec<&VlmPageResult> = results.iter().collect();
    pages.sort_by_key(|p| p.page_no);

    let mut trace: Vec<TraceEntry> = Vec::new();

    for page in pages {
        let dims = meta.page_dimensions.get(&page.page_no);
        let mut elements: Vec<_> = page.elements.iter().collect();
        elements.sort_by_key(|e| e.order);

        for element in elements {
            let prov = Provenance {
                page_no: page.page_no,
                bbox: convert_bbox(element.bbox.as_ref(), dims),
                charspan: [0, element.content.chars().count()],
            };

            let (self_ref, kind) = match element.label {
                Label::Picture => {
                    let self_ref = format!("#/pictures/{}", doc.pictures.len());
                    doc.pictures.push(PictureItem {
                        self_ref: self_ref.clone(),
                        parent: Some(ItemRef::new("#/body")),
                        children: Vec::new(),
                        label: Label::Picture,
                        prov: vec![prov],
                        captions: Vec::new(),
                        references: Vec::new(),
                        footnotes: Vec::new(),
                        annotations: Vec::new(),
                        image: None,
                    });
                    doc.body.children.push(ItemRef::new(&self_ref));
                    (self_ref, TraceKind::Picture)
                }
                Label::Table => {
                    let self_ref = format!("#/tables/{}", doc.tables.len());
                    doc.tables.push(TableItem {
                        self_ref: self_ref.clone(),
                        parent: Some(ItemRef::new("#/body")),
                        children: Vec::new(),
                        label: Label::Table,
                        prov: vec![prov],
                        captions: Vec::new(),
                        references: Vec::new(),
                        footnotes: Vec::new(),
                        data: parse_table_text(&element.content),
                    });
                    doc.body.children.push(ItemRef::new(&self_ref));
                    (self_ref, TraceKind::Table)
                }
                label => {
                    let self_ref = format!("#/texts/{}", doc.texts.len());
                    let parent_ref = if label.is_furniture() {
                        "#/furniture"
                    } else {
                        "#/body"
                    };
                    doc.texts.push(TextItem {
                        self_ref: self_ref.clone(),
                        parent: Some(ItemRef::new(parent_ref)),
                        children: Vec::new(),
                        label,
                        prov: vec![prov],
                        orig: element.content.clone(),
                        text: element.content.clone(),
                        level: if label == Label::SectionHeader {
                            element.level
                        } else {
                            None
                        },
                        enumerated: if label == Label::ListItem {
                            Some(
                                element
                                    .marker
                                    .as_deref()
                                    .map(|m| ENUMERATED_MARKER.is_match(m))
                                    .unwrap_or(false),
                            )
                        } else {
                            None
                        },
                        marker: if label == Label::ListItem {
                            element.marker.clone()
                        } else {
                            None
                        },
                    });
                    if label.is_furniture() {
                        doc.furniture.children.push(ItemRef::new(&self_ref));
                    } else {
                        doc.body.children.push(ItemRef::new(&self_ref));
                    }
                    let kind = if label == Label::Caption {
                        TraceKind::Caption
                    } else {
                        TraceKind::Other
                    };
                    (self_ref, kind)
                }
            };

            trace.push(TraceEntry {
                page_no: page.page_no,
                self_ref,
                kind,
            });
        }
    }

    link_captions(&mut doc, &trace);

    for (page_no, size) in &meta.page_dimensions {
        doc.pages.insert(
            page_no.to_string(),
            PageRecord {
                page_no: *page_no,
                size: *size,
                image: ImageRecord {
                    uri: String::new(),
                    mimetype: "image/png".to_string(),
                    dpi: meta.dpi,
                    size: *size,
                },
            },
        );
    }

    debug!(
        "Assembled {} texts, {} pictures, {} tables over {} pages",
        doc.texts.len(),
        doc.pictures.len(),
        doc.tables.len(),
        doc.pages.len()
    );

    doc
}

/// Convert a normalised top-left box to absolute pixels, bottom-left
/// origin. Missing box or unknown page dimensions yield a zero box.
fn convert_bbox(bbox: Option<&VlmBBox>, dims: Option<&PageSize>) -> DocBBox {
    match (bbox, dims) {
        (Some(bbox), Some(dims)) => DocBBox {
            l: bbox.l * dims.width,
            r: bbox.r * dims.width,
            t: (1.0 - bbox.t) * dims.height,
            b: (1.0 - bbox.b) * dims.height,
            coord_origin: CoordOrigin::BottomLeft,
        },
        _ => DocBBox {
            l: 0.0,
            t: 0.0,
            r: 0.0,
            b: 0.0,
            coord_origin: CoordOrigin::BottomLeft,
        },
    }
}

/// Link each caption to the nearest preceding picture or table on the same
/// page.
fn link_captions(doc: &mut CanonicalDocument, trace: &[TraceEntry]) {
    for (pos, entry) in trace.iter().enumerate() {
        if entry.kind != TraceKind::Caption {
            continue;
        }
        let target = trace[..pos]
            .iter()
            .rev()
            .take_while(|prior| prior.page_no == entry.page_no)
            .find(|prior| matches!(prior.kind, TraceKind::Picture | TraceKind::Table));

        let Some(target) = target else { continue };
        let Some((bucket, idx)) = CanonicalDocument::parse_ref(&target.self_ref) else {
            // Unparsable index: leave the caption unlinked.
            continue;
        };
        let caption_ref = ItemRef::new(&entry.self_ref);
        match bucket {
            crate::document::RefBucket::Pictures => {
                if let Some(picture) = doc.pictures.get_mut(idx) {
                    picture.captions.push(caption_ref);
                }
            }
            crate::document::RefBucket::Tables => {
                if let Some(table) = doc.tables.get_mut(idx) {
                    table.captions.push(caption_ref);
                }
            }
            crate::document::RefBucket::Texts => {}
        }
    }
}

/// Whitespace-delimited table pass-through: one row per line, cells split
/// on tabs or runs of two or more spaces. Rows are padded to a rectangular
/// grid with empty cells. No typed parsing.
fn parse_table_text(content: &str) -> TableData {
    let rows: Vec<Vec<String>> = content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            CELL_SEPARATOR
                .split(line.trim())
                .map(|cell| cell.trim().to_string())
                .collect()
        })
        .collect();

    let num_rows = rows.len();
    let num_cols = rows.iter().map(|r| r.len()).max().unwrap_or(0);

    let mut table_cells = Vec::new();
    let mut grid = Vec::with_capacity(num_rows);
    for (row_idx, row) in rows.iter().enumerate() {
        let mut grid_row = Vec::with_capacity(num_cols);
        for col_idx in 0..num_cols {
            let text = row.get(col_idx).cloned().unwrap_or_default();
            let cell = TableCell::new(text, row_idx, col_idx);
            table_cells.push(cell.clone());
            grid_row.push(cell);
        }
        grid.push(grid_row);
    }

    TableData {
        table_cells,
        grid,
        num_rows,
        num_cols,
    }
}

// ── Post-assembly builders ───────────────────────────────────────────────

/// Fill each page record's image URI: page N maps to
/// `pages/page_<N-1>.png`.
pub fn attach_page_images(doc: &mut CanonicalDocument) {
    for record in doc.pages.values_mut() {
        record.image.uri = format!("pages/page_{}.png", record.page_no.saturating_sub(1));
    }
}

/// Crop every picture's bbox out of its page raster into
/// `images/image_<i>.png` under `output_dir`, filling the picture's
/// `image` record.
///
/// A single unreadable raster or degenerate box is skipped with a warning;
/// the number of crops written is returned.
pub fn crop_pictures(doc: &mut CanonicalDocument, output_dir: &Path) -> Result<usize> {
    let images_dir = output_dir.join("images");
    std::fs::create_dir_all(&images_dir).map_err(|e| crate::error::HanjadocError::OutputWrite {
        path: images_dir.clone(),
        source: e,
    })?;

    let mut written = 0usize;
    for idx in 0..doc.pictures.len() {
        let (page_no, bbox) = {
            let picture = &doc.pictures[idx];
            let Some(prov) = picture.prov.first() else { continue };
            (prov.page_no, prov.bbox)
        };

        let Some(page) = doc.pages.get(&page_no.to_string()) else {
            continue;
        };
        let page_height = page.size.height;
        let dpi = page.image.dpi;

        // Back to top-left pixel coordinates for the crop.
        let x = bbox.l.max(0.0) as u32;
        let y = (page_height - bbox.t).max(0.0) as u32;
        let width = (bbox.r - bbox.l).max(0.0) as u32;
        let height = (bbox.t - bbox.b).max(0.0) as u32;
        if width == 0 || height == 0 {
            warn!("Picture {}: degenerate bbox, skipping crop", idx);
            continue;
        }

        let raster_path = output_dir.join(format!("pages/page_{}.png", page_no.saturating_sub(1)));
        let raster = match image::open(&raster_path) {
            Ok(img) => img,
            Err(e) => {
                warn!(
                    "Picture {}: cannot open raster {}: {}",
                    idx,
                    raster_path.display(),
                    e
                );
                continue;
            }
        };

        let width = width.min(raster.width().saturating_sub(x));
        let height = height.min(raster.height().saturating_sub(y));
        if width == 0 || height == 0 {
            warn!("Picture {}: bbox outside the raster, skipping crop", idx);
            continue;
        }

        let crop = raster.crop_imm(x, y, width, height);
        let crop_path = images_dir.join(format!("image_{}.png", idx));
        if let Err(e) = crop.save(&crop_path) {
            warn!("Picture {}: crop save failed: {}", idx, e);
            continue;
        }

        doc.pictures[idx].image = Some(ImageRecord {
            uri: format!("images/image_{}.png", idx),
            mimetype: "image/png".to_string(),
            dpi,
            size: PageSize {
                width: width as f64,
                height: height as f64,
            },
        });
        written += 1;
    }

    Ok(written)
}
