//! # Transcription Executor
//!
//! Runs one task from `loading` to a terminal status. Each engine event is
//! applied to the task and its [`Transcription`], and every change is
//! published right away:
//!
//! - the task goes to the scheduler (queue snapshots)
//! - the transcription goes to the broadcast channel (subscribers)
//!
//! ## Cancellation:
//! Cancellation is cooperative. The executor forwards it to the context and
//! keeps consuming events. If the context stays silent for longer than the
//! grace period the run is marked `canceled` right away, but the executor
//! still waits for the context's stream to end before returning. The next
//! task never starts while a previous context is still computing.

use chrono::Utc;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::WorkerError;
use crate::storage::Storage;
use crate::transcription::cache::{ContextCache, ResolvedContext};
use crate::transcription::context::{EventStream, TranscriptionEvent};
use crate::transcription::task::{
    Segment, Transcription, TranscriptionStatus, TranscriptionTask,
};

pub struct TranscriptionExecutor {
    cache: ContextCache,
    storage: Arc<Storage>,
    transcriptions: broadcast::Sender<Transcription>,
    cancel_grace: Duration,
}

impl TranscriptionExecutor {
    pub fn new(
        cache: ContextCache,
        storage: Arc<Storage>,
        transcriptions: broadcast::Sender<Transcription>,
        cancel_grace: Duration,
    ) -> Self {
        Self {
            cache,
            storage,
            transcriptions,
            cancel_grace,
        }
    }

    #[cfg(test)]
    pub fn cache(&self) -> &ContextCache {
        &self.cache
    }

    /// Run `task` until it reaches a terminal status and return its final state.
    pub async fn process(
        &mut self,
        task: TranscriptionTask,
        cancel: CancellationToken,
        task_updates: mpsc::UnboundedSender<TranscriptionTask>,
    ) -> TranscriptionTask {
        info!(
            task_id = %task.id,
            file = %task.file_name,
            variant = %task.model,
            "Starting transcription"
        );

        let mut run = Run::new(task, self.transcriptions.clone(), task_updates);
        run.set_status(TranscriptionStatus::Loading);
        self.drive(&mut run, &cancel).await;

        let task = run.task;
        match &task.status {
            TranscriptionStatus::Done { .. } => info!(
                task_id = %task.id,
                segments = task.segments.len(),
                elapsed_ms = run.transcription.timings.elapsed_ms,
                "Transcription finished"
            ),
            TranscriptionStatus::Error { message } => error!(
                task_id = %task.id,
                file = %task.file_name,
                error = %message,
                "Transcription failed"
            ),
            TranscriptionStatus::Canceled => {
                info!(task_id = %task.id, file = %task.file_name, "Transcription canceled")
            }
            other => warn!(task_id = %task.id, status = other.as_str(), "Run ended without a terminal status"),
        }
        task
    }

    async fn drive(&mut self, run: &mut Run, cancel: &CancellationToken) {
        let audio_path = match self.storage.audio_file_path(&run.task.file_name) {
            Ok(path) => path,
            Err(err) => return run.fail(&err),
        };

        let load_started = Instant::now();
        let resolved = match self.cache.resolve(&run.task.model).await {
            Ok(resolved) => resolved,
            Err(err) => return run.fail(&err),
        };
        run.record_context(&resolved, load_started.elapsed());

        // Loads are never interrupted; a cancel during loading lands here
        if cancel.is_cancelled() {
            return run.set_status(TranscriptionStatus::Canceled);
        }

        run.set_status(TranscriptionStatus::Progress {
            fraction: run.task.progress,
        });

        let mut events = match resolved
            .context
            .full_transcribe(&audio_path, &run.task.parameters)
            .await
        {
            Ok(events) => events,
            Err(err) => return run.fail(&err),
        };

        let mut cancel_deadline: Option<Instant> = None;
        loop {
            let next = match cancel_deadline {
                Some(deadline) => match timeout_at(deadline, events.next()).await {
                    Ok(event) => event,
                    Err(_) => {
                        warn!(
                            task_id = %run.task.id,
                            grace_ms = self.cancel_grace.as_millis() as u64,
                            "Inference context ignored cancellation, marking run canceled"
                        );
                        run.set_status(TranscriptionStatus::Canceled);
                        break;
                    }
                },
                None => tokio::select! {
                    event = events.next() => event,
                    _ = cancel.cancelled() => {
                        info!(task_id = %run.task.id, "Cancellation requested, stopping inference");
                        resolved.context.cancel();
                        cancel_deadline = Some(Instant::now() + self.cancel_grace);
                        continue;
                    }
                },
            };

            match next {
                Some(event) => {
                    if run.apply(event) {
                        break;
                    }
                }
                None if cancel_deadline.is_some() => {
                    return run.set_status(TranscriptionStatus::Canceled);
                }
                None => {
                    return run.set_status(TranscriptionStatus::Error {
                        message: "Inference ended without a result".to_string(),
                    });
                }
            }
        }

        self.wait_for_engine(run, events).await;
    }

    /// Hold the run until the engine closes its stream, so no other context
    /// starts while this one still computes. Late events are discarded.
    async fn wait_for_engine(&self, run: &Run, mut events: EventStream) {
        let mut waited = Duration::ZERO;
        loop {
            match timeout(self.cancel_grace, events.next()).await {
                Ok(Some(event)) => {
                    debug!(task_id = %run.task.id, ?event, "Discarding event after the run ended")
                }
                Ok(None) => break,
                Err(_) => {
                    waited += self.cancel_grace;
                    warn!(
                        task_id = %run.task.id,
                        waited_ms = waited.as_millis() as u64,
                        "Inference context still running, holding the queue"
                    );
                }
            }
        }

        if !waited.is_zero() {
            info!(task_id = %run.task.id, "Inference context stopped, releasing the queue");
        }
    }
}

/// State of the task being executed plus the channels it publishes to.
struct Run {
    task: TranscriptionTask,
    transcription: Transcription,
    initial_segments: Vec<Segment>,
    started: Instant,
    transcriptions: broadcast::Sender<Transcription>,
    task_updates: mpsc::UnboundedSender<TranscriptionTask>,
}

impl Run {
    fn new(
        task: TranscriptionTask,
        transcriptions: broadcast::Sender<Transcription>,
        task_updates: mpsc::UnboundedSender<TranscriptionTask>,
    ) -> Self {
        let mut transcription = Transcription::from_task(&task);
        transcription.timings.started_at = Some(Utc::now());

        Self {
            initial_segments: task.segments.clone(),
            task,
            transcription,
            started: Instant::now(),
            transcriptions,
            task_updates,
        }
    }

    fn publish(&self) {
        // Nobody listening is fine; the scheduler may also have moved on
        let _ = self.task_updates.send(self.task.clone());
        let _ = self.transcriptions.send(self.transcription.clone());
    }

    fn set_status(&mut self, status: TranscriptionStatus) {
        if !self.task.status.can_transition_to(&status) {
            warn!(
                task_id = %self.task.id,
                from = self.task.status.as_str(),
                to = status.as_str(),
                "Ignoring status regression"
            );
            return;
        }

        if status.is_terminal() {
            self.transcription.timings.finished_at = Some(Utc::now());
            self.transcription.timings.elapsed_ms = Some(self.started.elapsed().as_millis() as u64);
        }

        self.task.status = status.clone();
        self.transcription.status = status;
        self.publish();
    }

    fn fail(&mut self, err: &WorkerError) {
        self.set_status(TranscriptionStatus::Error {
            message: err.to_string(),
        });
    }

    fn set_segments(&mut self, segments: Vec<Segment>) {
        self.task.segments = segments.clone();
        self.transcription.segments = segments;
    }

    fn record_context(&mut self, resolved: &ResolvedContext, load_time: Duration) {
        if resolved.variant.id != self.task.model {
            info!(
                task_id = %self.task.id,
                requested = %self.task.model,
                used = %resolved.variant.id,
                "Task runs with fallback model"
            );
            self.task.model = resolved.variant.id.clone();
            self.transcription.model = resolved.variant.id.clone();
        }

        self.transcription.timings.context_reused = resolved.reused;
        if !resolved.reused {
            self.transcription.timings.model_load_ms = Some(load_time.as_millis() as u64);
        }
    }

    /// Apply one engine event. Returns true once the run is over.
    fn apply(&mut self, event: TranscriptionEvent) -> bool {
        let terminal = event.is_terminal();
        match event {
            TranscriptionEvent::NewSegment(segment) => {
                debug!(task_id = %self.task.id, start_ms = segment.start_ms, text = %segment.text, "New segment");
                let mut segments = self.transcription.segments.clone();
                segments.push(segment);
                self.set_segments(segments);
                self.set_status(TranscriptionStatus::Progress {
                    fraction: self.task.progress,
                });
            }
            TranscriptionEvent::Progress(fraction) => {
                debug!(task_id = %self.task.id, fraction, "Inference progress");
                self.task.progress = fraction.clamp(0.0, 1.0);
                let _ = self.task_updates.send(self.task.clone());
            }
            TranscriptionEvent::Error(message) => {
                self.set_status(TranscriptionStatus::Error { message });
            }
            TranscriptionEvent::Canceled => {
                self.set_status(TranscriptionStatus::Canceled);
            }
            TranscriptionEvent::Finished(segments) => {
                let mut all = self.initial_segments.clone();
                all.extend(segments);
                self.set_segments(all);
                self.set_status(TranscriptionStatus::Done {
                    completed_at: Utc::now(),
                });
            }
        }
        terminal
    }
}
