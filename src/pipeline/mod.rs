//! Pipeline stages for structured report extraction.
//!
//! Each submodule implements exactly one stage. Keeping stages separate
//! makes each independently testable and lets us swap implementations
//! (e.g. a different rasteriser) without touching the others.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ textlayer ─┐
//! (URL/path) (raster)  (pdftotext) │
//!                                  ▼
//!                    sampler ──▶ processor ──▶ assembler ──▶ corrector
//!                    (strategy)  (VLM pages)  (canonical)   (2nd pass)
//!                        │            │
//!                        ▼            ▼
//!                    validator ◀──────┘
//!                    (hallucination screen)
//! ```
//!
//! 1. [`input`]     — canonicalise the user-supplied path or URL
//! 2. [`render`]    — rasterise pages through the subprocess rasteriser
//! 3. [`textlayer`] — extract the PDF text layer as a reference signal
//! 4. [`sampler`]   — decide between the native OCR path and the VLM path
//! 5. [`processor`] — drive the VLM page by page with the retry ladder
//! 6. [`validator`] — screen VLM responses for hallucination patterns
//! 7. [`assembler`] — fold per-page elements into the canonical document
//! 8. [`corrector`] — second VLM pass fixing garbled Hanja by substitution

pub mod assembler;
pub mod corrector;
pub mod input;
pub mod processor;
pub mod render;
pub mod sampler;
pub mod textlayer;
pub mod validator;
