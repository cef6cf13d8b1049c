//! # Transcription Engine
//!
//! The seam between the streaming core and whatever turns PCM into text. The core
//! only needs one synchronous call per window: samples in, text and an optional
//! confidence out. Workers run that call on blocking threads, so implementations
//! are free to do heavy CPU/GPU inference.
//!
//! ## Contract:
//! - **Input**: normalized mono f32 samples at the service sample rate, plus an
//!   optional language hint (`None` means auto-detect)
//! - **Output**: possibly empty text and an optional confidence in [0, 1]
//! - **Failure**: an `EngineError` for this window only; the engine stays usable

use crate::error::EngineError;
use serde::Serialize;

/// Confidence reported when the engine does not provide one.
pub const DEFAULT_CONFIDENCE: f32 = 0.5;

/// Raw engine output for one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionOutput {
    pub text: String,
    pub confidence: Option<f32>,
}

impl TranscriptionOutput {
    pub fn new(text: impl Into<String>, confidence: Option<f32>) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }

    /// The text with surrounding whitespace removed, or `None` if nothing remains.
    pub fn meaningful_text(&self) -> Option<&str> {
        let trimmed = self.text.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }

    /// Confidence after defaulting and clamping.
    pub fn normalized_confidence(&self) -> f32 {
        normalize_confidence(self.confidence)
    }
}

/// Missing or NaN confidence becomes `DEFAULT_CONFIDENCE`; everything else is
/// clamped into [0, 1].
pub fn normalize_confidence(confidence: Option<f32>) -> f32 {
    match confidence {
        Some(value) if !value.is_nan() => value.clamp(0.0, 1.0),
        _ => DEFAULT_CONFIDENCE,
    }
}

/// Speech-to-text backend.
pub trait TranscriptionEngine: Send + Sync {
    /// Transcribe one window. Called from a blocking worker thread.
    fn transcribe(
        &self,
        samples: &[f32],
        language: Option<&str>,
    ) -> Result<TranscriptionOutput, EngineError>;

    /// Human-readable engine name for health reporting.
    fn name(&self) -> String;

    /// Whether the engine can accept work.
    fn is_ready(&self) -> bool {
        true
    }
}
