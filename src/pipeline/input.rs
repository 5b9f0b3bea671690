//! PDF source resolution.
//!
//! Report jobs arrive two ways: a path on the local filesystem, or an
//! HTTP(S) URL into an institutional archive. Both normalise to a
//! [`PdfSource`] that owns a readable local path, because every
//! downstream tool (rasteriser, pdftotext, pdfinfo) wants a real file.
//! Downloads land in a scratch directory that removes itself when the
//! source is dropped, panic included.
//!
//! The `%PDF` magic is checked before a source is handed out, and for
//! downloads before anything touches disk. Archive links frequently serve
//! an HTML error page with a `.pdf` name; failing here with [`NotAPdf`]
//! beats a cryptic rasteriser exit three stages later.
//!
//! [`NotAPdf`]: HanjadocError::NotAPdf

use crate::error::{HanjadocError, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// Scratch filename for downloaded documents. The original URL filename
/// carries no information the pipeline uses, so it is not preserved.
const FETCHED_NAME: &str = "source.pdf";

/// A PDF the pipeline can read from disk.
pub enum PdfSource {
    /// Caller-supplied local file, used in place.
    Local(PathBuf),
    /// Downloaded copy inside a self-cleaning scratch directory.
    Fetched { path: PathBuf, _scratch: TempDir },
}

impl PdfSource {
    /// The on-disk path, wherever the source came from.
    pub fn path(&self) -> &Path {
        match self {
            PdfSource::Local(path) => path,
            PdfSource::Fetched { path, .. } => path,
        }
    }
}

/// Whether the input names a URL rather than a filesystem path.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Normalise a user-supplied path or URL to a readable [`PdfSource`].
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<PdfSource> {
    if is_url(input) {
        fetch_pdf(input, timeout_secs).await
    } else {
        open_local(input)
    }
}

/// Reject anything whose first bytes are not `%PDF`.
fn check_magic(leading: &[u8], path: &Path) -> Result<()> {
    if leading.len() >= 4 && &leading[..4] == b"%PDF" {
        return Ok(());
    }
    let mut magic = [0u8; 4];
    for (slot, byte) in magic.iter_mut().zip(leading) {
        *slot = *byte;
    }
    Err(HanjadocError::NotAPdf {
        path: path.to_path_buf(),
        magic,
    })
}

/// Open a local file and verify it is a PDF.
fn open_local(input: &str) -> Result<PdfSource> {
    let path = PathBuf::from(input);

    let mut file = std::fs::File::open(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => HanjadocError::PermissionDenied {
            path: path.clone(),
        },
        _ => HanjadocError::FileNotFound { path: path.clone() },
    })?;

    let mut leading = [0u8; 4];
    let read = file.read(&mut leading).unwrap_or(0);
    check_magic(&leading[..read], &path)?;

    debug!("Using local PDF: {}", path.display());
    Ok(PdfSource::Local(path))
}

/// Download a PDF into a scratch directory.
///
/// The body is validated as a PDF while still in memory; nothing is
/// written for non-PDF responses.
async fn fetch_pdf(url: &str, timeout_secs: u64) -> Result<PdfSource> {
    info!("Fetching PDF: {}", url);

    let failed = |reason: String| HanjadocError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| {
            if e.is_timeout() {
                HanjadocError::DownloadTimeout {
                    url: url.to_string(),
                    secs: timeout_secs,
                }
            } else if let Some(status) = e.status() {
                failed(format!("HTTP {status}"))
            } else {
                failed(e.to_string())
            }
        })?;

    let body = response.bytes().await.map_err(|e| failed(e.to_string()))?;

    let scratch = TempDir::new().map_err(|e| HanjadocError::Internal(e.to_string()))?;
    let path = scratch.path().join(FETCHED_NAME);
    check_magic(&body, &path)?;

    tokio::fs::write(&path, &body)
        .await
        .map_err(|e| HanjadocError::Internal(format!("scratch write failed: {e}")))?;
    info!("Fetched {} bytes to {}", body.len(), path.display());

    Ok(PdfSource::Fetched {
        path,
        _scratch: scratch,
    })
}
