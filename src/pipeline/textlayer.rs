//! PDF text-layer extraction: a reference signal, never authoritative.
//!
//! Scanned reports frequently carry a text layer produced by some earlier
//! OCR run. It is often garbled, especially the Hanja, but still useful
//! twice: the strategy sampler inspects it to detect a Hangul-Hanja mix
//! without touching the VLM, and the corrector aligns it against VLM output
//! as a second witness.
//!
//! Every failure here is recovered locally: a missing tool, a non-zero
//! exit, or undecodable output logs a warning and degrades to `""` / `0`.
//! The pipeline continues without the reference signal.

use std::collections::BTreeMap;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, warn};

/// Per-page text layer, keyed by 1-based page number.
pub type PageTextLayer = BTreeMap<usize, String>;

/// Subprocess text-layer extractor (`pdftotext` + `pdfinfo`).
#[derive(Debug, Clone)]
pub struct PdfTextExtractor {
    pdftotext_bin: String,
    pdfinfo_bin: String,
}

impl Default for PdfTextExtractor {
    fn default() -> Self {
        Self::new("pdftotext", "pdfinfo")
    }
}

impl PdfTextExtractor {
    pub fn new(pdftotext_bin: impl Into<String>, pdfinfo_bin: impl Into<String>) -> Self {
        Self {
            pdftotext_bin: pdftotext_bin.into(),
            pdfinfo_bin: pdfinfo_bin.into(),
        }
    }

    /// Page count from the page-info tool's `Pages: <n>` line.
    ///
    /// Returns 0 on any failure.
    pub async fn page_count(&self, pdf_path: &Path) -> usize {
        let output = match Command::new(&self.pdfinfo_bin).arg(pdf_path).output().await {
            Ok(o) => o,
            Err(e) => {
                warn!("pdfinfo spawn failed for {}: {}", pdf_path.display(), e);
                return 0;
            }
        };

        if !output.status.success() {
            warn!(
                "pdfinfo exited non-zero for {}: {}",
                pdf_path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return 0;
        }

        parse_page_count(&String::from_utf8_lossy(&output.stdout)).unwrap_or_else(|| {
            warn!("pdfinfo output had no Pages line for {}", pdf_path.display());
            0
        })
    }

    /// Extract the text layer of one page (1-based), preserving layout so
    /// column order survives.
    ///
    /// Returns `""` on any failure.
    pub async fn extract_page_text(&self, pdf_path: &Path, page: usize) -> String {
        let output = match Command::new(&self.pdftotext_bin)
            .arg("-f")
            .arg(page.to_string())
            .arg("-l")
            .arg(page.to_string())
            .arg("-layout")
            .arg(pdf_path)
            .arg("-")
            .output()
            .await
        {
            Ok(o) => o,
            Err(e) => {
                warn!("pdftotext spawn failed for {}: {}", pdf_path.display(), e);
                return String::new();
            }
        };

        if !output.status.success() {
            warn!(
                "pdftotext exited non-zero for page {} of {}: {}",
                page,
                pdf_path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return String::new();
        }

        String::from_utf8_lossy(&output.stdout).into_owned()
    }

    /// Extract the text layer of pages `1..=total_pages`.
    pub async fn extract_text(&self, pdf_path: &Path, total_pages: usize) -> PageTextLayer {
        let mut texts = PageTextLayer::new();
        for page in 1..=total_pages {
            let text = self.extract_page_text(pdf_path, page).await;
            debug!("Text layer page {}: {} bytes", page, text.len());
            texts.insert(page, text);
        }
        texts
    }
}

/// Parse `Pages: <n>` out of pdfinfo output.
fn parse_page_count(stdout: &str) -> Option<usize> {
    stdout
        .lines()
        .find_map(|line| line.strip_prefix("Pages:"))
        .and_then(|rest| rest.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pages_line() {
        let stdout = "Title:          發掘調査報告書\nAuthor:\nPages:          212\nEncrypted:      no\n";
        assert_eq!(parse_page_count(stdout), Some(212));
    }

    #[test]
    fn missing_pages_line_is_none() {
        assert_eq!(parse_page_count("Title: x\n"), None);
        assert_eq!(parse_page_count("Pages: many\n"), None);
        assert_eq!(parse_page_count(""), None);
    }

    #[tokio::test]
    async fn missing_tools_degrade_to_empty() {
        let extractor = PdfTextExtractor::new("no-such-pdftotext", "no-such-pdfinfo");
        let pdf = Path::new("/tmp/absent.pdf");
        assert_eq!(extractor.page_count(pdf).await, 0);
        assert_eq!(extractor.extract_page_text(pdf, 1).await, "");
    }
}
