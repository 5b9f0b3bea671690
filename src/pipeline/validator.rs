//! Response-quality validation: a cheap, stateless hallucination screen.
//!
//! VLMs fail on scanned report pages in a handful of recognisable ways:
//! boilerplate filler text, a description of the image instead of its
//! transcription, a romanised "best effort" that drops the Korean script,
//! or a degenerate repetition loop. Each check is a pure function over the
//! non-picture element texts; all checks always run and their issues are
//! accumulated, so the retry prompt can enumerate everything that went
//! wrong at once.

use crate::document::{Label, VlmPageElement};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// The closed set of issue types the screen can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    PlaceholderText,
    ScriptAnomaly,
    MetaDescription,
    RepetitivePattern,
}

impl IssueType {
    /// Wire/prompt name (snake_case).
    pub fn as_str(self) -> &'static str {
        match self {
            IssueType::PlaceholderText => "placeholder_text",
            IssueType::ScriptAnomaly => "script_anomaly",
            IssueType::MetaDescription => "meta_description",
            IssueType::RepetitivePattern => "repetitive_pattern",
        }
    }
}

/// One detected issue and the reading orders it affects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub issue: IssueType,
    pub orders: Vec<u32>,
}

/// The screen's verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// The distinct issue types present, in detection order.
    pub fn issue_types(&self) -> Vec<IssueType> {
        let mut types = Vec::new();
        for issue in &self.issues {
            if !types.contains(&issue.issue) {
                types.push(issue.issue);
            }
        }
        types
    }
}

static PLACEHOLDER_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"lorem\s+ipsum",
        r"dolor\s+sit\s+amet",
        r"consectetur\s+adipiscing",
        r"sed\s+do\s+eiusmod",
        r"ut\s+labore\s+et\s+dolore",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).unwrap())
    .collect()
});

static META_DESCRIPTION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // Korean meta-description markers.
        r"이미지\s*해상도",
        r"이\s*이미지는",
        r"이미지에는",
        r"텍스트를\s*읽을\s*수\s*없",
        r"판독할\s*수\s*없",
        // English meta-description markers.
        r"(?i)the\s+image\s+contains",
        r"(?i)the\s+image\s+shows",
        r"(?i)this\s+is\s+an?\s+(image|scan|photograph)",
        r"(?i)unable\s+to\s+transcribe",
        r"(?i)text\s+is\s+not\s+legible",
        r"(?i)cannot\s+be\s+(read|transcribed)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Minimum stripped length before the script-ratio check applies. Shorter
/// fragments (a page number, a lone caption) say nothing about the script
/// balance of a Korean page.
const SCRIPT_CHECK_MIN_CHARS: usize = 20;

/// Minimum fraction of Hangul+CJK among non-whitespace characters on a
/// Korean document page.
const SCRIPT_MIN_RATIO: f64 = 0.10;

/// Fraction of the concatenated content a repetition run must cover.
const REPETITION_MAX_SHARE: f64 = 0.30;

/// Minimum length of a degenerate run: one seed token plus four repeats.
const REPETITION_MIN_RUN: usize = 5;

/// Run all checks over a page's elements.
pub fn validate(elements: &[VlmPageElement], document_languages: &[String]) -> ValidationResult {
    let textual: Vec<&VlmPageElement> = elements
        .iter()
        .filter(|e| e.label != Label::Picture && !e.content.trim().is_empty())
        .collect();

    let mut issues = Vec::new();

    if let Some(orders) = check_patterns(&textual, &PLACEHOLDER_PATTERNS) {
        issues.push(ValidationIssue {
            issue: IssueType::PlaceholderText,
            orders,
        });
    }

    if let Some(orders) = check_script_anomaly(&textual, document_languages) {
        issues.push(ValidationIssue {
            issue: IssueType::ScriptAnomaly,
            orders,
        });
    }

    if let Some(orders) = check_patterns(&textual, &META_DESCRIPTION_PATTERNS) {
        issues.push(ValidationIssue {
            issue: IssueType::MetaDescription,
            orders,
        });
    }

    if let Some(orders) = check_repetition(&textual) {
        issues.push(ValidationIssue {
            issue: IssueType::RepetitivePattern,
            orders,
        });
    }

    ValidationResult {
        is_valid: issues.is_empty(),
        issues,
    }
}

/// Orders of elements matching any pattern in `patterns`, or `None`.
fn check_patterns(textual: &[&VlmPageElement], patterns: &[Regex]) -> Option<Vec<u32>> {
    let orders: Vec<u32> = textual
        .iter()
        .filter(|e| patterns.iter().any(|p| p.is_match(&e.content)))
        .map(|e| e.order)
        .collect();
    if orders.is_empty() {
        None
    } else {
        Some(orders)
    }
}

/// Korean pages whose transcription is almost entirely non-Korean script
/// are a strong hallucination signal (romanisation, filler English).
///
/// Only applies when the first document language starts with `ko`.
fn check_script_anomaly(
    textual: &[&VlmPageElement],
    document_languages: &[String],
) -> Option<Vec<u32>> {
    if !document_languages
        .first()
        .map(|l| l.starts_with("ko"))
        .unwrap_or(false)
    {
        return None;
    }

    let concatenated: String = textual.iter().map(|e| e.content.as_str()).collect();
    let stripped: Vec<char> = concatenated.chars().filter(|c| !c.is_whitespace()).collect();
    if stripped.len() < SCRIPT_CHECK_MIN_CHARS {
        return None;
    }

    let korean = stripped
        .iter()
        .filter(|&&c| crate::pipeline::sampler::is_hangul(c) || crate::pipeline::sampler::is_cjk(c))
        .count();

    if (korean as f64) / (stripped.len() as f64) < SCRIPT_MIN_RATIO {
        Some(textual.iter().map(|e| e.order).collect())
    } else {
        None
    }
}

/// Degenerate repetition: the same single non-whitespace character repeated
/// (whitespace-separated) five or more times, covering more than 30% of the
/// concatenated content.
///
/// The reference pattern is `(\S)(\s+\1){4,}`; the `regex` crate has no
/// backreferences, so this is the equivalent token scan.
fn check_repetition(textual: &[&VlmPageElement]) -> Option<Vec<u32>> {
    let concatenated: String = textual
        .iter()
        .map(|e| e.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    if concatenated.is_empty() {
        return None;
    }

    let mut matched_len = 0usize;
    let mut run_char: Option<char> = None;
    let mut run_count = 0usize;
    let mut run_start = 0usize;
    let mut run_end = 0usize;

    let mut flush = |run_char: &mut Option<char>, run_count: &mut usize, start: usize, end: usize| {
        if run_char.is_some() && *run_count >= REPETITION_MIN_RUN {
            matched_len += end - start;
        }
        *run_char = None;
        *run_count = 0;
    };

    let mut token_start = None;
    let mut chars = concatenated.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c.is_whitespace() {
            continue;
        }
        // A token is a maximal non-whitespace span.
        if token_start.is_none() {
            token_start = Some(i);
        }
        let next_is_boundary = chars
            .peek()
            .map(|(_, nc)| nc.is_whitespace())
            .unwrap_or(true);
        if next_is_boundary {
            let start = token_start.take().unwrap();
            let end = i + c.len_utf8();
            let token = &concatenated[start..end];
            let single = {
                let mut it = token.chars();
                match (it.next(), it.next()) {
                    (Some(ch), None) => Some(ch),
                    _ => None,
                }
            };
            match (single, run_char) {
                (Some(ch), Some(prev)) if ch == prev => {
                    run_count += 1;
                    run_end = end;
                }
                (Some(ch), _) => {
                    flush(&mut run_char, &mut run_count, run_start, run_end);
                    run_char = Some(ch);
                    run_count = 1;
                    run_start = start;
                    run_end = end;
                }
                (None, _) => {
                    flush(&mut run_char, &mut run_count, run_start, run_end);
                }
            }
        }
    }
    flush(&mut run_char, &mut run_count, run_start, run_end);

    if matched_len as f64 > concatenated.len() as f64 * REPETITION_MAX_SHARE {
        Some(textual.iter().map(|e| e.order).collect())
    } else {
        None
    }
}
