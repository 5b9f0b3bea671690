//! Prompts and structured-output schemas for every VLM call.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth**: tightening a transcription rule or
//!    adding a type code happens in exactly one place.
//! 2. **Testability**: unit tests inspect prompts and schemas directly
//!    without a live model.

use serde_json::{json, Value};

// ── Page analysis ────────────────────────────────────────────────────────

/// Structured-output prompt for per-page element extraction.
///
/// Field names are abbreviated (`t,c,o,l,m,b`) to keep output tokens down
/// on dense report pages; the nine type codes map 1:1 onto
/// [`crate::document::Label`].
pub const PAGE_ANALYSIS_PROMPT: &str = r#"Analyze this scanned page from a Korean archaeological report and extract every content element.

Output JSON with a single key "e": an array of elements in reading order, top-to-bottom then left-to-right. Each element has:
  t: type code, one of
     tx = body text paragraph
     sh = section header
     cp = figure/table caption
     fn = footnote
     ph = page header (running head)
     pf = page footer (running foot, page number)
     li = list item
     pc = picture/figure/photograph/drawing region
     tb = table
  c: the text content, transcribed VERBATIM including Hanja characters.
     Empty string for pc elements.
  o: reading-order index, an integer starting at 0, unique per page.
  l: heading level (1-based), sh elements only.
  m: list marker as printed (e.g. "1." or "-"), li elements only.
  b: bounding box [left, top, right, bottom], each 0..1 relative to the
     page, origin at the top-left. REQUIRED for pc elements; include it
     for tb elements when possible.

Rules:
- Transcribe exactly what is printed. Do not translate Hanja to Hangul,
  do not modernise spelling, do not summarise.
- For tb elements put the table text in c, one row per line, columns
  separated by two or more spaces.
- Never describe the image ("this image contains..."); transcribe it.
- Do not invent content for blank regions; a blank page yields an empty
  "e" array."#;

/// Prefix injected when the document languages are known.
pub fn language_context(languages: &[String]) -> String {
    format!("LANGUAGE CONTEXT: this document is written in {}. Expect mixed Hangul and Hanja (Chinese characters) in that language context.\n\n", languages.join(", "))
}

/// Text-layer reference block prepended when the PDF carries a usable
/// text layer for this page.
pub fn text_reference_block(page_text: &str) -> String {
    format!(
        "TEXT-REFERENCE: the PDF text layer for this page is reproduced below. \
It may be garbled or out of order; verify every character against the page \
image and ignore reference text that does not match what is printed.\n\
-----\n{page_text}\n-----\n\n"
    )
}

/// Augmented instruction for the quality retry, enumerating the issues the
/// validator found in the previous attempt.
pub fn quality_retry_suffix(issues: &[crate::pipeline::validator::IssueType]) -> String {
    let names: Vec<&str> = issues.iter().map(|i| i.as_str()).collect();
    format!(
        "\n\nPREVIOUS ATTEMPT REJECTED: the last extraction of this page was rejected for: {}. \
Re-read the page image carefully and transcribe only the text that is actually printed on it.",
        names.join(", ")
    )
}

/// Schema for the page-analysis structured output.
pub fn page_analysis_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "e": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "t": { "type": "string", "enum": ["tx","sh","cp","fn","ph","pf","li","pc","tb"] },
                        "c": { "type": "string" },
                        "o": { "type": "integer", "minimum": 0 },
                        "l": { "type": "integer", "minimum": 1 },
                        "m": { "type": "string" },
                        "b": {
                            "type": "array",
                            "items": { "type": "number", "minimum": 0, "maximum": 1 },
                            "minItems": 4,
                            "maxItems": 4
                        }
                    },
                    "required": ["t", "c", "o"]
                }
            }
        },
        "required": ["e"]
    })
}

// ── Strategy sampling ────────────────────────────────────────────────────

/// Detection prompt for the OCR strategy sampler.
pub const HANJA_DETECTION_PROMPT: &str = r#"Look at this scanned page. Answer two questions about the printed text:

1. Does the page mix Hangul (Korean script) with Hanja (Chinese characters) in the same running text? Isolated punctuation or numerals do not count; look for Chinese characters embedded in Korean sentences or headings.
2. Which languages appear on the page?

Output JSON: {"hasKoreanHanjaMix": true|false, "detectedLanguages": ["ko-KR", ...]} using BCP-47 tags."#;

/// Schema for the detection structured output.
pub fn hanja_detection_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "hasKoreanHanjaMix": { "type": "boolean" },
            "detectedLanguages": {
                "type": "array",
                "items": { "type": "string" }
            }
        },
        "required": ["hasKoreanHanjaMix", "detectedLanguages"]
    })
}

// ── Text correction ──────────────────────────────────────────────────────

/// System prompt for the second-pass Hanja correction call.
///
/// The model receives numbered OCR lines (and optional `|ref|` lines from
/// the PDF text layer), plus the page image, and answers with substitutions
/// only, never a rewrite.
pub const CORRECTION_SYSTEM_PROMPT: &str = r#"You are proofreading OCR output from a scanned Korean archaeological report against the original page image. The OCR text below is mostly correct Hangul, but Hanja (Chinese characters) are frequently garbled: wrong character, missing strokes, or a visually similar but incorrect glyph.

Input lines have the form:
  <index>|<type>|<ocr text>        an OCR text item
  <index>|ref|<reference text>     the PDF text layer for the same item (may itself be garbled)
  <table>|<row>,<col>|<cell text>  a table cell
  C_REF:                           leftover text-layer lines that may belong to table cells

Compare each line with the page image. Where the OCR text differs from what is printed, emit a substitution. NEVER rewrite whole lines; only emit the minimal garbled fragment and its replacement. Preserve spacing and punctuation exactly as printed. If a line is already correct, emit nothing for it.

Output JSON:
  {"tc": [{"i": <text index>, "s": [{"f": "<garbled fragment>", "r": "<replacement>"}, ...]}, ...],
   "cc": [{"ti": <table index>, "r": <row>, "c": <col>, "t": "<full corrected cell text>"}, ...]}

Return {"tc": [], "cc": []} when nothing needs correction."#;

/// Schema for the correction structured output.
pub fn correction_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "tc": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "i": { "type": "integer", "minimum": 0 },
                        "s": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "f": { "type": "string" },
                                    "r": { "type": "string" }
                                },
                                "required": ["f", "r"]
                            }
                        }
                    },
                    "required": ["i", "s"]
                }
            },
            "cc": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "ti": { "type": "integer", "minimum": 0 },
                        "r": { "type": "integer", "minimum": 0 },
                        "c": { "type": "integer", "minimum": 0 },
                        "t": { "type": "string" }
                    },
                    "required": ["ti", "r", "c", "t"]
                }
            }
        },
        "required": ["tc", "cc"]
    })
}
