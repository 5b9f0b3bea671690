//! The vision-call primitive consumed by every VLM-facing component.
//!
//! The concrete LLM API client lives outside this crate. The pipeline only
//! ever talks to a [`VisionModel`]: one operation that takes a message list,
//! a JSON schema for the structured output, a primary/fallback model pair,
//! and returns the schema-validated payload plus token accounting. Schema
//! validation and the retry ladder across primary → fallback are the
//! primitive's responsibility; the pipeline's own retries (empty pages,
//! quality issues) sit above this seam.
//!
//! Implementations must honour the [`AbortSignal`]: return
//! [`HanjadocError::Aborted`] promptly once it is raised.

use crate::abort::AbortSignal;
use crate::error::{HanjadocError, Result};
use crate::usage::{ModelRole, TokenUsage, TokenUsageAggregator};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One part of a vision message: text, or a base64 data-URI image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VisionContent {
    Text { text: String },
    Image { image: String },
}

/// A chat message for the vision primitive. The pipeline only emits user
/// turns; system instructions travel as the leading text part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisionMessage {
    pub role: String,
    pub content: Vec<VisionContent>,
}

impl VisionMessage {
    /// A user turn with the given parts.
    pub fn user(content: Vec<VisionContent>) -> Self {
        Self {
            role: "user".to_string(),
            content,
        }
    }
}

/// Build a text content part.
pub fn text_part(text: impl Into<String>) -> VisionContent {
    VisionContent::Text { text: text.into() }
}

/// Wrap raw PNG bytes as a data-URI image part.
///
/// PNG is lossless; compression artefacts on rendered Hangul/Hanja glyphs
/// measurably hurt transcription accuracy, so pages are never re-encoded
/// as JPEG on the way to the model.
pub fn png_part(png_bytes: &[u8]) -> VisionContent {
    VisionContent::Image {
        image: format!("data:image/png;base64,{}", STANDARD.encode(png_bytes)),
    }
}

/// A single structured-output vision request.
#[derive(Debug, Clone)]
pub struct VisionCall {
    /// JSON schema the output must conform to.
    pub schema: Value,
    pub messages: Vec<VisionMessage>,
    pub primary_model: String,
    pub fallback_model: Option<String>,
    /// Retries *inside* the primitive, per model.
    pub max_retries: u32,
    pub temperature: f32,
    /// Component name for token accounting, e.g. `"vlm-page-processor"`.
    pub component: &'static str,
    /// Phase name for token accounting, e.g. `"page-analysis"`.
    pub phase: &'static str,
    pub abort: AbortSignal,
}

/// Token counts reported by the primitive for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallTokens {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// The outcome of a successful vision call.
#[derive(Debug, Clone)]
pub struct VisionOutcome {
    /// Schema-conforming structured output.
    pub output: Value,
    pub tokens: CallTokens,
    /// Concrete model that answered.
    pub model_name: String,
    /// Whether the fallback model produced the answer.
    pub used_fallback: bool,
}

impl VisionOutcome {
    /// Convert this outcome into a [`TokenUsage`] record for the aggregator.
    pub fn to_usage(&self, component: &str, phase: &str) -> TokenUsage {
        TokenUsage {
            component: component.to_string(),
            phase: phase.to_string(),
            model: if self.used_fallback {
                ModelRole::Fallback
            } else {
                ModelRole::Primary
            },
            model_name: self.model_name.clone(),
            input_tokens: self.tokens.input_tokens,
            output_tokens: self.tokens.output_tokens,
            total_tokens: self.tokens.input_tokens + self.tokens.output_tokens,
        }
    }
}

/// The vision-call primitive.
///
/// Implemented by the enclosing application (or by a mock in tests); the
/// pipeline holds it as an `Arc<dyn VisionModel>`.
#[async_trait::async_trait]
pub trait VisionModel: Send + Sync {
    /// Execute one structured-output vision request.
    ///
    /// On success the returned `output` is already validated against
    /// `call.schema`. Exhausted retries surface as
    /// [`HanjadocError::VlmCall`]; a raised abort signal as
    /// [`HanjadocError::Aborted`].
    async fn call_vision(&self, call: VisionCall) -> Result<VisionOutcome>;
}

/// Issue a call, track its usage, and decode the payload into `T`.
///
/// This is the one funnel every component uses, so usage records can never
/// be forgotten and shape mismatches always carry the component name.
pub async fn call_and_track<T: serde::de::DeserializeOwned>(
    model: &dyn VisionModel,
    call: VisionCall,
    aggregator: &TokenUsageAggregator,
) -> Result<T> {
    call.abort.check()?;
    let component = call.component;
    let phase = call.phase;
    let outcome = model.call_vision(call).await?;
    aggregator.track(outcome.to_usage(component, phase));
    serde_json::from_value(outcome.output).map_err(|e| HanjadocError::VlmResponseShape {
        component,
        detail: e.to_string(),
    })
}
