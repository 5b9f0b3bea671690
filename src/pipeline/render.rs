//! Page rasterisation through the external rasteriser.
//!
//! The rasteriser is any tool accepting `-density N <pdf> <out-pattern>`
//! (ImageMagick's `magick`/`convert` in practice). It renders every page of
//! the document in one invocation; we then enumerate the produced
//! `page_<i>.png` files and sort them by numeric index; lexicographic
//! order would interleave `page_10` between `page_1` and `page_2`.
//!
//! Rendering failure is fatal to the pipeline: without page rasters there
//! is nothing for the VLM to read.

use crate::error::{HanjadocError, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Options for a render run.
#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    /// Rendering DPI. 300 for the final VLM pass, 150 for sampling.
    pub dpi: u32,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self { dpi: 300 }
    }
}

/// Result of a render run.
#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub page_count: usize,
    pub pages_dir: PathBuf,
    /// `pages/page_<i>.png`, sorted by numeric index.
    pub page_files: Vec<PathBuf>,
}

/// Subprocess page renderer. Stateless; holds only the executable name.
#[derive(Debug, Clone)]
pub struct PageRenderer {
    bin: String,
}

impl Default for PageRenderer {
    fn default() -> Self {
        Self::new("magick")
    }
}

impl PageRenderer {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    /// Rasterise every page of `pdf_path` into `output_dir/pages/`.
    ///
    /// Page files are named `page_<i>.png` with a 0-based index. The pages
    /// directory is created if missing.
    pub async fn render(
        &self,
        pdf_path: &Path,
        output_dir: &Path,
        options: RenderOptions,
    ) -> Result<RenderOutput> {
        let pages_dir = output_dir.join("pages");
        tokio::fs::create_dir_all(&pages_dir)
            .await
            .map_err(|e| HanjadocError::OutputWrite {
                path: pages_dir.clone(),
                source: e,
            })?;

        let pattern = pages_dir.join("page_%d.png");
        info!(
            "Rasterising {} at {} DPI into {}",
            pdf_path.display(),
            options.dpi,
            pages_dir.display()
        );

        let output = Command::new(&self.bin)
            .arg("-density")
            .arg(options.dpi.to_string())
            .arg(pdf_path)
            .arg(&pattern)
            .output()
            .await
            .map_err(|e| HanjadocError::Rendering {
                detail: format!("failed to spawn '{}': {}", self.bin, e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() {
                "Unknown error".to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(HanjadocError::Rendering { detail });
        }

        let page_files = collect_page_files(&pages_dir).await?;
        debug!("Rendered {} pages", page_files.len());

        Ok(RenderOutput {
            page_count: page_files.len(),
            pages_dir,
            page_files,
        })
    }
}

/// Enumerate `page_<i>.png` files in numeric order.
async fn collect_page_files(pages_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(pages_dir)
        .await
        .map_err(|e| HanjadocError::Internal(format!("read_dir failed: {}", e)))?;

    let mut indexed: Vec<(usize, PathBuf)> = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| HanjadocError::Internal(format!("read_dir failed: {}", e)))?
    {
        let path = entry.path();
        if let Some(idx) = page_index(&path) {
            indexed.push((idx, path));
        }
    }

    indexed.sort_by_key(|(idx, _)| *idx);
    Ok(indexed.into_iter().map(|(_, p)| p).collect())
}

/// Parse the numeric index out of a `page_<i>.png` filename.
pub fn page_index(path: &Path) -> Option<usize> {
    let stem = path.file_stem()?.to_str()?;
    if path.extension()?.to_str()? != "png" {
        return None;
    }
    stem.strip_prefix("page_")?.parse().ok()
}
