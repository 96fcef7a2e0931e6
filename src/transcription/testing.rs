//! Test doubles shared by the transcription tests.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::WorkerError;
use crate::storage::Storage;
use crate::transcription::catalog::{ModelCatalog, ModelVariant};
use crate::transcription::context::{
    ContextProvider, EventStream, InferenceContext, TranscriptionEvent, VoiceLanguage,
};
use crate::transcription::resources::MemoryProbe;
use crate::transcription::task::{Segment, TranscriptionParameters};

pub const MB: u64 = 1024 * 1024;

/// Catalog with `small` (50 MB, default), `medium` (300 MB) and `large` (600 MB).
/// Only the ids in `downloaded` get a directory on disk.
pub fn test_catalog(downloaded: &[&str]) -> (ModelCatalog, TempDir) {
    let dir = TempDir::new().unwrap();
    for id in downloaded {
        std::fs::create_dir_all(dir.path().join(id)).unwrap();
    }
    let variants = vec![
        ModelVariant::new("small", "small test model", 1, 50 * MB, dir.path().join("small")),
        ModelVariant::new("medium", "medium test model", 2, 300 * MB, dir.path().join("medium")),
        ModelVariant::new("large", "large test model", 3, 600 * MB, dir.path().join("large")),
    ];
    (ModelCatalog::new(variants, "small").unwrap(), dir)
}

/// Recordings directory holding empty files with the given names.
pub fn test_storage(files: &[&str]) -> (Arc<Storage>, TempDir) {
    let dir = TempDir::new().unwrap();
    for file in files {
        std::fs::write(dir.path().join(file), b"RIFF").unwrap();
    }
    (Arc::new(Storage::new(dir.path())), dir)
}

pub struct FixedMemory {
    available: AtomicU64,
}

impl FixedMemory {
    pub fn new(available: u64) -> Self {
        Self {
            available: AtomicU64::new(available),
        }
    }
}

impl MemoryProbe for FixedMemory {
    fn available_memory(&self) -> u64 {
        self.available.load(Ordering::SeqCst)
    }

    fn total_memory(&self) -> u64 {
        self.available.load(Ordering::SeqCst) * 2
    }
}

#[derive(Debug, Clone)]
pub enum Step {
    Emit(TranscriptionEvent),
    Sleep(Duration),
    /// Produce nothing until canceled (or forever when cancellation is ignored)
    Hang,
}

#[derive(Default)]
struct Counters {
    loads: AtomicUsize,
    transcribe_calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

/// Provider whose contexts replay a fixed script of events.
pub struct ScriptedProvider {
    script: Vec<Step>,
    honors_cancel: bool,
    fail_loads: bool,
    load_delay: Duration,
    panic_on: Option<String>,
    counters: Arc<Counters>,
}

impl ScriptedProvider {
    pub fn with_script(script: Vec<Step>) -> Self {
        Self {
            script,
            honors_cancel: true,
            fail_loads: false,
            load_delay: Duration::ZERO,
            panic_on: None,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Two segments, a progress report, then `Finished`.
    pub fn finishing() -> Self {
        let segments = vec![Segment::new(0, 1_000, "hello"), Segment::new(1_000, 2_000, "world")];
        Self::with_script(vec![
            Step::Emit(TranscriptionEvent::NewSegment(segments[0].clone())),
            Step::Emit(TranscriptionEvent::Progress(0.5)),
            Step::Emit(TranscriptionEvent::NewSegment(segments[1].clone())),
            Step::Emit(TranscriptionEvent::Finished(segments)),
        ])
    }

    /// Emits nothing until canceled.
    pub fn hanging() -> Self {
        Self::with_script(vec![Step::Hang])
    }

    pub fn ignoring_cancel(mut self) -> Self {
        self.honors_cancel = false;
        self
    }

    pub fn failing_loads(mut self) -> Self {
        self.fail_loads = true;
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Contexts panic when asked to transcribe `file_name`.
    pub fn panicking_on(mut self, file_name: &str) -> Self {
        self.panic_on = Some(file_name.to_string());
        self
    }

    pub fn loads(&self) -> usize {
        self.counters.loads.load(Ordering::SeqCst)
    }

    pub fn transcribe_calls(&self) -> usize {
        self.counters.transcribe_calls.load(Ordering::SeqCst)
    }

    /// Transcriptions running right now.
    pub fn active(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    /// Highest number of transcriptions that ever ran at the same time.
    pub fn max_active(&self) -> usize {
        self.counters.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContextProvider for ScriptedProvider {
    async fn load(&self, variant: &ModelVariant) -> Result<Arc<dyn InferenceContext>, WorkerError> {
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        if self.fail_loads {
            return Err(WorkerError::ModelLoad {
                variant: variant.id.clone(),
                message: "weights are corrupt".to_string(),
            });
        }
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedContext {
            script: self.script.clone(),
            honors_cancel: self.honors_cancel,
            panic_on: self.panic_on.clone(),
            counters: Arc::clone(&self.counters),
            cancel_flag: Mutex::new(None),
        }))
    }

    fn available_languages(&self) -> Vec<VoiceLanguage> {
        vec![VoiceLanguage::new("en", "English"), VoiceLanguage::new("de", "German")]
    }
}

struct ScriptedContext {
    script: Vec<Step>,
    honors_cancel: bool,
    panic_on: Option<String>,
    counters: Arc<Counters>,
    cancel_flag: Mutex<Option<Arc<AtomicBool>>>,
}

struct ActiveGuard(Arc<Counters>);

impl ActiveGuard {
    fn enter(counters: Arc<Counters>) -> Self {
        let now = counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_active.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl InferenceContext for ScriptedContext {
    async fn full_transcribe(
        &self,
        audio_path: &Path,
        _parameters: &TranscriptionParameters,
    ) -> Result<EventStream, WorkerError> {
        self.counters.transcribe_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(file_name) = &self.panic_on {
            if audio_path.ends_with(file_name) {
                panic!("decoder crashed on {}", audio_path.display());
            }
        }
        let canceled = Arc::new(AtomicBool::new(false));
        *self.cancel_flag.lock().unwrap() = Some(Arc::clone(&canceled));

        let (tx, rx) = mpsc::channel(16);
        let script = self.script.clone();
        let honors_cancel = self.honors_cancel;
        let guard = ActiveGuard::enter(Arc::clone(&self.counters));

        tokio::spawn(async move {
            let _guard = guard;
            let stop_requested = || honors_cancel && canceled.load(Ordering::SeqCst);
            for step in script {
                if stop_requested() {
                    let _ = tx.send(TranscriptionEvent::Canceled).await;
                    return;
                }
                match step {
                    Step::Emit(event) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Step::Sleep(duration) => tokio::time::sleep(duration).await,
                    Step::Hang => loop {
                        if stop_requested() {
                            let _ = tx.send(TranscriptionEvent::Canceled).await;
                            return;
                        }
                        if tx.is_closed() {
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    },
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    fn cancel(&self) {
        if let Some(flag) = self.cancel_flag.lock().unwrap().as_ref() {
            flag.store(true, Ordering::SeqCst);
        }
    }
}
