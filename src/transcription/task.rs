//! # Tasks, Transcriptions and their Status
//!
//! A [`TranscriptionTask`] is a request sitting in the queue; a
//! [`Transcription`] is the result-so-far that subscribers observe. Both share
//! the same id and the same [`TranscriptionStatus`].
//!
//! ## Status State Machine:
//! ```text
//! not_started → loading → progress(f) → done(at)
//!                                     → error(message)
//!                                     → canceled
//! ```
//! `done`, `error` and `canceled` are terminal. Within one run a status never
//! moves backwards; re-enqueuing a file starts a new run from `not_started`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type TaskId = Uuid;

/// A timed piece of transcribed text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

impl Segment {
    pub fn new(start_ms: u64, end_ms: u64, text: impl Into<String>) -> Self {
        Self {
            start_ms,
            end_ms,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TranscriptionStatus {
    NotStarted,
    Loading,
    Progress { fraction: f64 },
    Done { completed_at: DateTime<Utc> },
    Error { message: String },
    Canceled,
}

impl TranscriptionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TranscriptionStatus::Done { .. }
                | TranscriptionStatus::Error { .. }
                | TranscriptionStatus::Canceled
        )
    }

    /// Position in the run's lifecycle; terminal states share the last rank.
    fn rank(&self) -> u8 {
        match self {
            TranscriptionStatus::NotStarted => 0,
            TranscriptionStatus::Loading => 1,
            TranscriptionStatus::Progress { .. } => 2,
            _ => 3,
        }
    }

    /// Whether moving from `self` to `next` keeps the run monotonic.
    pub fn can_transition_to(&self, next: &TranscriptionStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TranscriptionStatus::NotStarted => "not_started",
            TranscriptionStatus::Loading => "loading",
            TranscriptionStatus::Progress { .. } => "progress",
            TranscriptionStatus::Done { .. } => "done",
            TranscriptionStatus::Error { .. } => "error",
            TranscriptionStatus::Canceled => "canceled",
        }
    }
}

/// Knobs passed through to the inference engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionParameters {
    /// ISO 639-1 code, `None` lets the engine detect the language
    pub language: Option<String>,
    /// Translate the speech into English instead of transcribing it
    pub translate: bool,
    /// Text that conditions the decoder (names, vocabulary)
    pub initial_prompt: Option<String>,
    /// Audio before this point is skipped
    pub offset_ms: u64,
}

/// One queued unit of work: transcribe one recording with one model variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionTask {
    pub id: TaskId,
    pub file_name: String,
    pub model: String,
    pub parameters: TranscriptionParameters,
    pub segments: Vec<Segment>,
    pub progress: f64,
    pub status: TranscriptionStatus,
    pub created_at: DateTime<Utc>,
}

impl TranscriptionTask {
    pub fn new(
        file_name: impl Into<String>,
        model: impl Into<String>,
        parameters: TranscriptionParameters,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_name: file_name.into(),
            model: model.into(),
            parameters,
            segments: Vec::new(),
            progress: 0.0,
            status: TranscriptionStatus::NotStarted,
            created_at: Utc::now(),
        }
    }

    /// A task that continues an earlier, unfinished run.
    ///
    /// The prior segments are kept at the front of the result and inference
    /// starts where the last of them ended.
    pub fn resuming(
        file_name: impl Into<String>,
        model: impl Into<String>,
        mut parameters: TranscriptionParameters,
        prior_segments: Vec<Segment>,
    ) -> Self {
        if let Some(last) = prior_segments.last() {
            parameters.offset_ms = parameters.offset_ms.max(last.end_ms);
        }
        let mut task = Self::new(file_name, model, parameters);
        task.segments = prior_segments;
        task
    }
}

/// Timing information collected while a task runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionTimings {
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub model_load_ms: Option<u64>,
    pub context_reused: bool,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_ms: Option<u64>,
}

/// The observable result of a task, published on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    pub id: TaskId,
    pub file_name: String,
    pub segments: Vec<Segment>,
    pub parameters: TranscriptionParameters,
    pub model: String,
    pub status: TranscriptionStatus,
    pub timings: TranscriptionTimings,
}

impl Transcription {
    /// Projection of a task as it stands right now.
    pub fn from_task(task: &TranscriptionTask) -> Self {
        Self {
            id: task.id,
            file_name: task.file_name.clone(),
            segments: task.segments.clone(),
            parameters: task.parameters.clone(),
            model: task.model.clone(),
            status: task.status.clone(),
            timings: TranscriptionTimings {
                queued_at: Some(task.created_at),
                ..Default::default()
            },
        }
    }

    /// Segment texts joined with single spaces.
    pub fn text(&self) -> String {
        self.segments
            .iter()
            .map(|segment| segment.text.trim())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_are_monotonic() {
        let loading = TranscriptionStatus::Loading;
        let progress = TranscriptionStatus::Progress { fraction: 0.4 };
        let done = TranscriptionStatus::Done {
            completed_at: Utc::now(),
        };

        assert!(TranscriptionStatus::NotStarted.can_transition_to(&loading));
        assert!(loading.can_transition_to(&progress));
        assert!(progress.can_transition_to(&progress));
        assert!(progress.can_transition_to(&done));
        assert!(loading.can_transition_to(&TranscriptionStatus::Canceled));

        assert!(!progress.can_transition_to(&loading));
        assert!(!done.can_transition_to(&TranscriptionStatus::Canceled));
        assert!(!TranscriptionStatus::Canceled.can_transition_to(&progress));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TranscriptionStatus::Canceled.is_terminal());
        assert!(TranscriptionStatus::Error {
            message: "x".into()
        }
        .is_terminal());
        assert!(!TranscriptionStatus::Progress { fraction: 1.0 }.is_terminal());
        assert!(!TranscriptionStatus::NotStarted.is_terminal());
    }

    #[test]
    fn test_resuming_task_starts_after_prior_segments() {
        let prior = vec![Segment::new(0, 4_000, "hello"), Segment::new(4_000, 9_500, "world")];
        let task = TranscriptionTask::resuming(
            "memo.wav",
            "base",
            TranscriptionParameters::default(),
            prior.clone(),
        );

        assert_eq!(task.parameters.offset_ms, 9_500);
        assert_eq!(task.segments, prior);
        assert_eq!(task.status, TranscriptionStatus::NotStarted);
    }

    #[test]
    fn test_status_serializes_with_state_tag() {
        let json = serde_json::to_value(TranscriptionStatus::Progress { fraction: 0.5 }).unwrap();
        assert_eq!(json["state"], "progress");
        assert_eq!(json["fraction"], 0.5);
    }

    #[test]
    fn test_transcription_text_joins_segments() {
        let mut task = TranscriptionTask::new("a.wav", "tiny", TranscriptionParameters::default());
        task.segments = vec![Segment::new(0, 1, " one "), Segment::new(1, 2, ""), Segment::new(2, 3, "two")];
        assert_eq!(Transcription::from_task(&task).text(), "one two");
    }
}
