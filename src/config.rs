//! Configuration for the extraction pipeline.
//!
//! All behaviour is controlled through [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. Keeping every knob in one struct makes it
//! trivial to share configs across tasks, serialise them for logging, and
//! diff two runs to understand why their outputs differ.

use crate::error::{HanjadocError, Result};
use serde::{Deserialize, Serialize};

/// Configuration for a full extraction run.
///
/// # Example
/// ```rust
/// use hanjadoc::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .dpi(300)
///     .concurrency(4)
///     .model("gpt-4.1-mini")
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Rendering DPI for the final VLM pass. Range: 72–600. Default: 300.
    ///
    /// Archaeological reports mix small-print footnotes with dense Hanja
    /// glyphs; 300 DPI keeps individual strokes legible to the model.
    pub dpi: u32,

    /// Rendering DPI for strategy sampling. Default: 150.
    ///
    /// Sampling only needs to answer "is there a Hangul-Hanja mix on this
    /// page", which survives half the resolution of the final pass.
    pub sample_dpi: u32,

    /// Maximum pages sampled by the strategy sampler. Default: 15.
    pub max_sample_pages: usize,

    /// Worker-pool size for VLM page processing and correction. Default: 1.
    pub concurrency: usize,

    /// Primary VLM model identifier, passed opaquely to the vision
    /// primitive. Default: `"gpt-4.1-mini"`.
    pub model: String,

    /// Fallback model used when the primary exhausts its retries.
    pub fallback_model: Option<String>,

    /// Initial generation temperature. Default: 0.
    ///
    /// Transcription wants determinism; the retry ladder raises this on its
    /// own when a page comes back empty or fails validation.
    pub temperature: f32,

    /// Retries inside a single vision call. Default: 3.
    pub max_retries: u32,

    /// BCP-47 language tags injected into prompts as language context.
    /// Empty means no context prefix.
    pub document_languages: Vec<String>,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Rasteriser executable (must accept `-density N <pdf> <pattern>`).
    /// Default: `"magick"`.
    pub rasterizer_bin: String,

    /// Text-layer extractor executable (must accept
    /// `-f N -l N -layout <pdf> -`). Default: `"pdftotext"`.
    pub pdftotext_bin: String,

    /// Page-info executable (must emit a `Pages: <n>` line).
    /// Default: `"pdfinfo"`.
    pub pdfinfo_bin: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dpi: 300,
            sample_dpi: 150,
            max_sample_pages: 15,
            concurrency: 1,
            model: "gpt-4.1-mini".to_string(),
            fallback_model: None,
            temperature: 0.0,
            max_retries: 3,
            document_languages: Vec::new(),
            download_timeout_secs: 120,
            rasterizer_bin: "magick".to_string(),
            pdftotext_bin: "pdftotext".to_string(),
            pdfinfo_bin: "pdfinfo".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Create a new builder.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn sample_dpi(mut self, dpi: u32) -> Self {
        self.config.sample_dpi = dpi.clamp(72, 600);
        self
    }

    pub fn max_sample_pages(mut self, n: usize) -> Self {
        self.config.max_sample_pages = n.max(1);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn fallback_model(mut self, model: impl Into<String>) -> Self {
        self.config.fallback_model = Some(model.into());
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn document_languages<I, S>(mut self, langs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.document_languages = langs.into_iter().map(Into::into).collect();
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn rasterizer_bin(mut self, bin: impl Into<String>) -> Self {
        self.config.rasterizer_bin = bin.into();
        self
    }

    pub fn pdftotext_bin(mut self, bin: impl Into<String>) -> Self {
        self.config.pdftotext_bin = bin.into();
        self
    }

    pub fn pdfinfo_bin(mut self, bin: impl Into<String>) -> Self {
        self.config.pdfinfo_bin = bin.into();
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 600 {
            return Err(HanjadocError::InvalidConfig(format!(
                "DPI must be 72–600, got {}",
                c.dpi
            )));
        }
        if c.concurrency == 0 {
            return Err(HanjadocError::InvalidConfig("Concurrency must be ≥ 1".into()));
        }
        if c.model.is_empty() {
            return Err(HanjadocError::InvalidConfig(
                "A primary model identifier is required".into(),
            ));
        }
        Ok(self.config)
    }
}

/// A caller-supplied strategy override that bypasses sampling entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyOverride {
    pub forced_method: crate::pipeline::sampler::OcrMethod,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pipeline_contract() {
        let c = PipelineConfig::default();
        assert_eq!(c.dpi, 300);
        assert_eq!(c.sample_dpi, 150);
        assert_eq!(c.max_sample_pages, 15);
        assert_eq!(c.concurrency, 1);
        assert_eq!(c.temperature, 0.0);
        assert_eq!(c.max_retries, 3);
    }

    #[test]
    fn builder_clamps_out_of_range_values() {
        let c = PipelineConfig::builder()
            .dpi(2000)
            .concurrency(0)
            .temperature(9.0)
            .build()
            .unwrap();
        assert_eq!(c.dpi, 600);
        assert_eq!(c.concurrency, 1);
        assert_eq!(c.temperature, 2.0);
    }

    #[test]
    fn empty_model_is_rejected() {
        let result = PipelineConfig::builder().model("").build();
        assert!(matches!(result, Err(HanjadocError::InvalidConfig(_))));
    }
}
