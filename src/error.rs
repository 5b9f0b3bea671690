//! Error types for the hanjadoc library.
//!
//! A single fatal error enum covers everything that aborts the pipeline.
//! Locally-recovered failures never surface here: a failed text-layer
//! extraction becomes an empty string, a failed correction page keeps its
//! OCR text and increments `pages_failed` in the returned summary. The
//! taxonomy is deliberately small; callers match on the variant to decide
//! whether the input, the environment, or the model is at fault.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the hanjadoc library.
#[derive(Debug, Error)]
pub enum HanjadocError {
    // ── Input errors ──────────────────────────────────────────────────────

    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── Pipeline errors ───────────────────────────────────────────────────

    /// The page rasteriser exited non-zero.
    #[error("Rasterisation failed: {detail}")]
    Rendering { detail: String },

    /// The vision primitive exhausted its retries (primary and fallback).
    #[error("VLM call failed in {component}: {message}")]
    VlmCall {
        component: &'static str,
        message: String,
    },

    /// The VLM answered, but the payload did not match the requested schema.
    #[error("VLM response for {component} did not match the schema: {detail}")]
    VlmResponseShape {
        component: &'static str,
        detail: String,
    },

    /// The abort signal was raised. Always rethrown; scoped resources are
    /// still released on the way out.
    #[error("Operation aborted")]
    Aborted,

    // ── Document I/O ──────────────────────────────────────────────────────

    /// Could not read or parse a canonical document JSON file.
    #[error("Failed to load document '{path}': {detail}")]
    DocumentLoad { path: PathBuf, detail: String },

    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HanjadocError>;
