//! # Inference Contexts
//!
//! The worker never talks to a speech model directly. It asks a
//! [`ContextProvider`] to load a variant into an [`InferenceContext`] and then
//! consumes the context's event stream.
//!
//! ## Event Stream Contract:
//! - Zero or more `NewSegment` / `Progress` events, then exactly one of
//!   `Finished`, `Error` or `Canceled`, then the stream ends.
//! - After [`InferenceContext::cancel`] the context should stop as soon as it
//!   can and end with `Canceled`. It is not required to stop immediately.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::error::WorkerError;
use crate::transcription::catalog::ModelVariant;
use crate::transcription::task::{Segment, TranscriptionParameters};

/// Events produced while a context transcribes one file.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptionEvent {
    NewSegment(Segment),
    /// Fraction of the audio processed so far, 0.0..=1.0
    Progress(f64),
    Error(String),
    Canceled,
    /// Every segment of the run, in order
    Finished(Vec<Segment>),
}

impl TranscriptionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TranscriptionEvent::Error(_)
                | TranscriptionEvent::Canceled
                | TranscriptionEvent::Finished(_)
        )
    }
}

pub type EventStream = BoxStream<'static, TranscriptionEvent>;

/// A loaded model able to transcribe audio files one at a time.
#[async_trait]
pub trait InferenceContext: Send + Sync {
    /// Start transcribing `audio_path`. Events arrive lazily on the returned stream.
    async fn full_transcribe(
        &self,
        audio_path: &Path,
        parameters: &TranscriptionParameters,
    ) -> Result<EventStream, WorkerError>;

    /// Ask the running transcription to stop.
    fn cancel(&self);
}

/// Loads model variants into contexts.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn load(&self, variant: &ModelVariant) -> Result<Arc<dyn InferenceContext>, WorkerError>;

    /// Languages the engine can transcribe, without the automatic option.
    fn available_languages(&self) -> Vec<VoiceLanguage>;
}

/// A language the user can pick for a transcription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceLanguage {
    /// ISO 639-1 code, or `auto`
    pub code: String,
    pub name: String,
}

impl VoiceLanguage {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
        }
    }

    pub fn auto() -> Self {
        Self::new("auto", "Auto-detect")
    }
}
