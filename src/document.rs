//! Document model: per-page VLM elements and the canonical assembled
//! document.
//!
//! The canonical document is a parent-owned flat arena: `texts`,
//! `pictures`, and `tables` hold the items by value, and every cross
//! reference is a string address (`self_ref` like `"#/texts/3"`, pointed at
//! by `{"$ref": …}` entries). Items are never embedded inside one another,
//! so the structure serialises to plain JSON with no cycles and resolution
//! is an index lookup.
//!
//! Coordinate conventions: the VLM reports normalised boxes with a top-left
//! origin ([`VlmBBox`]); the canonical document stores absolute pixel boxes
//! with a bottom-left origin ([`DocBBox`]), matching PDF convention. The
//! conversion happens exactly once, in the assembler.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Labels ───────────────────────────────────────────────────────────────

/// The closed set of content labels.
///
/// The same nine values tag both VLM page elements and canonical items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    Text,
    SectionHeader,
    Caption,
    Footnote,
    PageHeader,
    PageFooter,
    ListItem,
    Picture,
    Table,
}

impl Label {
    /// Page furniture (running headers/footers) is kept out of the body.
    pub fn is_furniture(self) -> bool {
        matches!(self, Label::PageHeader | Label::PageFooter)
    }

    /// Two-letter wire code used in VLM prompts and responses.
    pub fn code(self) -> &'static str {
        match self {
            Label::Text => "tx",
            Label::SectionHeader => "sh",
            Label::Caption => "cp",
            Label::Footnote => "fn",
            Label::PageHeader => "ph",
            Label::PageFooter => "pf",
            Label::ListItem => "li",
            Label::Picture => "pc",
            Label::Table => "tb",
        }
    }

    /// Decode a two-letter wire code.
    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "tx" => Label::Text,
            "sh" => Label::SectionHeader,
            "cp" => Label::Caption,
            "fn" => Label::Footnote,
            "ph" => Label::PageHeader,
            "pf" => Label::PageFooter,
            "li" => Label::ListItem,
            "pc" => Label::Picture,
            "tb" => Label::Table,
            _ => return None,
        })
    }
}

// ── VLM-side types ───────────────────────────────────────────────────────

/// Normalised rectangle from the VLM: `l,t,r,b ∈ [0,1]`, origin top-left.
///
/// Used only between VLM output and the assembler; never exposed
/// downstream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VlmBBox {
    pub l: f64,
    pub t: f64,
    pub r: f64,
    pub b: f64,
}

/// A single content item on a page, as produced by the VLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VlmPageElement {
    pub label: Label,
    /// Transcribed text; empty for pictures.
    pub content: String,
    /// Page-local reading order, 0-based.
    pub order: u32,
    /// Heading level, `section_header` only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
    /// List marker, `list_item` only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marker: Option<String>,
    /// Required for pictures, optional otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<VlmBBox>,
}

/// Residual quality metadata attached to a page that needed a retry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageQuality {
    /// Whether any retry (empty-page or quality) occurred.
    pub retried: bool,
    /// Issue types still present after the final attempt.
    pub issues: Vec<crate::pipeline::validator::IssueType>,
}

/// The VLM's output for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VlmPageResult {
    pub page_no: usize,
    pub elements: Vec<VlmPageElement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<PageQuality>,
}

// ── Canonical document ───────────────────────────────────────────────────

/// Coordinate origin marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordOrigin {
    #[default]
    #[serde(rename = "BOTTOMLEFT")]
    BottomLeft,
    #[serde(rename = "TOPLEFT")]
    TopLeft,
}

/// Absolute pixel rectangle in the canonical document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DocBBox {
    pub l: f64,
    pub t: f64,
    pub r: f64,
    pub b: f64,
    pub coord_origin: CoordOrigin,
}

/// Provenance: where an item sits on its source page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub page_no: usize,
    pub bbox: DocBBox,
    /// `[0, text.len()]`, covering the whole item.
    pub charspan: [usize; 2],
}

/// A `{"$ref": "#/texts/3"}` pointer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemRef {
    #[serde(rename = "$ref")]
    pub reference: String,
}

impl ItemRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
        }
    }
}

/// The `body` / `furniture` root nodes: ordered `$ref` lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupNode {
    pub self_ref: String,
    pub children: Vec<ItemRef>,
}

impl GroupNode {
    fn new(self_ref: &str) -> Self {
        Self {
            self_ref: self_ref.to_string(),
            children: Vec::new(),
        }
    }
}

/// A text-like item (`text`, `section_header`, `caption`, `footnote`,
/// `list_item`, `page_header`, `page_footer`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextItem {
    pub self_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<ItemRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ItemRef>,
    pub label: Label,
    pub prov: Vec<Provenance>,
    /// Original transcription. Kept equal to `text` after correction.
    pub orig: String,
    pub text: String,
    /// Heading level, section headers only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
    /// Whether a list item is enumerated (numbered).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enumerated: Option<bool>,
    /// List marker as written on the page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marker: Option<String>,
}

/// A picture region. Content lives in the cropped image file; the item
/// itself carries only links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PictureItem {
    pub self_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<ItemRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ItemRef>,
    pub label: Label,
    pub prov: Vec<Provenance>,
    /// Always present (possibly empty) so consumers can iterate without
    /// null checks.
    pub captions: Vec<ItemRef>,
    pub references: Vec<ItemRef>,
    pub footnotes: Vec<ItemRef>,
    pub annotations: Vec<serde_json::Value>,
    /// Cropped region image, filled by the image builder.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageRecord>,
}

/// One table cell. Spans default to 1; text is whitespace-delimited
/// pass-through, never typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCell {
    pub text: String,
    pub start_row_offset_idx: usize,
    pub start_col_offset_idx: usize,
    pub row_span: usize,
    pub col_span: usize,
}

impl TableCell {
    pub fn new(text: impl Into<String>, row: usize, col: usize) -> Self {
        Self {
            text: text.into(),
            start_row_offset_idx: row,
            start_col_offset_idx: col,
            row_span: 1,
            col_span: 1,
        }
    }
}

/// Table payload: a flat cell list plus the row-major grid view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableData {
    pub table_cells: Vec<TableCell>,
    pub grid: Vec<Vec<TableCell>>,
    pub num_rows: usize,
    pub num_cols: usize,
}

/// A table item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableItem {
    pub self_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<ItemRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ItemRef>,
    pub label: Label,
    pub prov: Vec<Provenance>,
    pub captions: Vec<ItemRef>,
    pub references: Vec<ItemRef>,
    pub footnotes: Vec<ItemRef>,
    pub data: TableData,
}

/// Width/height pair in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PageSize {
    pub width: f64,
    pub height: f64,
}

/// A page raster reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub uri: String,
    pub mimetype: String,
    pub dpi: u32,
    pub size: PageSize,
}

/// One page entry in the canonical document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    pub page_no: usize,
    pub size: PageSize,
    pub image: ImageRecord,
}

/// Which arena a `self_ref` addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefBucket {
    Texts,
    Pictures,
    Tables,
}

/// The assembled output document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalDocument {
    pub schema_name: String,
    pub version: String,
    pub name: String,
    pub body: GroupNode,
    pub furniture: GroupNode,
    pub texts: Vec<TextItem>,
    pub pictures: Vec<PictureItem>,
    pub tables: Vec<TableItem>,
    /// Keyed by the page number's decimal string.
    pub pages: BTreeMap<String, PageRecord>,
}

impl CanonicalDocument {
    pub const SCHEMA_NAME: &'static str = "DoclingDocument";
    pub const VERSION: &'static str = "1.3.0";

    /// An empty document with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema_name: Self::SCHEMA_NAME.to_string(),
            version: Self::VERSION.to_string(),
            name: name.into(),
            body: GroupNode::new("#/body"),
            furniture: GroupNode::new("#/furniture"),
            texts: Vec::new(),
            pictures: Vec::new(),
            tables: Vec::new(),
            pages: BTreeMap::new(),
        }
    }

    /// Parse a `self_ref` / `$ref` address into its bucket and index.
    pub fn parse_ref(reference: &str) -> Option<(RefBucket, usize)> {
        let rest = reference.strip_prefix("#/")?;
        let (bucket, idx) = rest.split_once('/')?;
        let idx: usize = idx.parse().ok()?;
        let bucket = match bucket {
            "texts" => RefBucket::Texts,
            "pictures" => RefBucket::Pictures,
            "tables" => RefBucket::Tables,
            _ => return None,
        };
        Some((bucket, idx))
    }

    /// Whether a `$ref` resolves to an existing item.
    pub fn resolves(&self, reference: &str) -> bool {
        match Self::parse_ref(reference) {
            Some((RefBucket::Texts, i)) => i < self.texts.len(),
            Some((RefBucket::Pictures, i)) => i < self.pictures.len(),
            Some((RefBucket::Tables, i)) => i < self.tables.len(),
            None => false,
        }
    }

    /// Page numbers present in the document, sorted numerically.
    ///
    /// The `pages` map is keyed by decimal strings, which sort
    /// lexicographically in the `BTreeMap`; callers always want numeric
    /// order.
    pub fn page_numbers(&self) -> Vec<usize> {
        let mut numbers: Vec<usize> = self
            .pages
            .keys()
            .filter_map(|k| k.parse().ok())
            .collect();
        numbers.sort_unstable();
        numbers
    }

    /// Serialise as pretty-printed UTF-8 JSON.
    pub fn to_pretty_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Load a document from a JSON file.
    pub async fn load(path: &std::path::Path) -> crate::error::Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| crate::error::HanjadocError::DocumentLoad {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        serde_json::from_slice(&bytes).map_err(|e| crate::error::HanjadocError::DocumentLoad {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }

    /// Persist as pretty-printed JSON to `path`.
    pub async fn save(&self, path: &std::path::Path) -> crate::error::Result<()> {
        let json = self
            .to_pretty_json()
            .map_err(|e| crate::error::HanjadocError::Internal(e.to_string()))?;
        tokio::fs::write(path, json).await.map_err(|e| {
            crate::error::HanjadocError::OutputWrite {
                path: path.to_path_buf(),
                source: e,
            }
        })
    }
}
