//! # Task Scheduler
//!
//! Owns the transcription queue and runs its tasks one after another.
//!
//! ## Architecture:
//! - A single spawned loop owns the queue. [`TaskScheduler`] handles send it
//!   commands over a channel and wait for an acknowledgement, so mutations
//!   apply in the order they were sent.
//! - The head of the queue is handed to the [`TranscriptionExecutor`] in its
//!   own task. The loop keeps serving commands while that run is in flight.
//! - Executor updates flow back to the loop, which republishes the queue.
//!
//! ## Ordering Rules:
//! - FIFO, one run at a time. A canceled run leaves the queue immediately but
//!   the next task only starts once the canceled run has returned.
//! - Nothing runs until the scheduler is activated.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::transcription::executor::TranscriptionExecutor;
use crate::transcription::task::{
    TaskId, Transcription, TranscriptionStatus, TranscriptionTask,
};

enum Command {
    Enqueue {
        task: TranscriptionTask,
        reply: oneshot::Sender<bool>,
    },
    Cancel {
        file_name: String,
        reply: oneshot::Sender<bool>,
    },
    CancelAll {
        reply: oneshot::Sender<usize>,
    },
    Activate,
}

/// Handle to the scheduler loop. Cheap to clone.
#[derive(Clone)]
pub struct TaskScheduler {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<Vec<TranscriptionTask>>,
    queue_updates: broadcast::Sender<Vec<TranscriptionTask>>,
}

impl TaskScheduler {
    /// Start the scheduler loop on the current runtime.
    pub fn spawn(
        executor: TranscriptionExecutor,
        transcriptions: broadcast::Sender<Transcription>,
        update_capacity: usize,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Vec::new());
        let (queue_updates, _) = broadcast::channel(update_capacity);

        let scheduler_loop = SchedulerLoop {
            commands: commands_rx,
            task_updates: updates_rx,
            task_updates_tx: updates_tx,
            executor: Arc::new(Mutex::new(executor)),
            queue: Vec::new(),
            active: None,
            activated: false,
            snapshot: snapshot_tx,
            queue_updates: queue_updates.clone(),
            transcriptions,
        };
        tokio::spawn(scheduler_loop.run());

        Self {
            commands: commands_tx,
            snapshot: snapshot_rx,
            queue_updates,
        }
    }

    /// Append `task` unless its file is already queued. Returns whether it was added.
    pub async fn enqueue(&self, task: TranscriptionTask) -> bool {
        self.request(|reply| Command::Enqueue { task, reply })
            .await
            .unwrap_or(false)
    }

    /// Cancel the task for `file_name`, running or queued. Returns whether one was found.
    pub async fn cancel(&self, file_name: &str) -> bool {
        let file_name = file_name.to_string();
        self.request(|reply| Command::Cancel { file_name, reply })
            .await
            .unwrap_or(false)
    }

    /// Cancel the running task and empty the queue. Returns how many tasks were removed.
    pub async fn cancel_all(&self) -> usize {
        self.request(|reply| Command::CancelAll { reply })
            .await
            .unwrap_or(0)
    }

    /// Let the loop start pulling tasks. Idempotent.
    pub fn activate(&self) {
        let _ = self.commands.send(Command::Activate);
    }

    pub fn resume_handle(&self) -> ResumeHandle {
        ResumeHandle {
            commands: self.commands.clone(),
        }
    }

    pub fn current_tasks(&self) -> Vec<TranscriptionTask> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<TranscriptionTask>> {
        self.queue_updates.subscribe()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, response) = oneshot::channel();
        if self.commands.send(build(reply)).is_err() {
            warn!("Task scheduler is not running");
            return None;
        }
        response.await.ok()
    }
}

/// Lets a host environment restart processing after it was suspended.
#[derive(Clone)]
pub struct ResumeHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ResumeHandle {
    pub fn resume(&self) {
        debug!("Resuming task processing");
        let _ = self.commands.send(Command::Activate);
    }
}

/// Host hook for keeping work alive while the process is in the background.
pub trait BackgroundExecution: Send + Sync {
    fn register(&self, resume: ResumeHandle);
}

/// A long-running server process that is never suspended.
pub struct ResidentProcess;

impl BackgroundExecution for ResidentProcess {
    fn register(&self, _resume: ResumeHandle) {
        debug!("Resident process, background continuation not needed");
    }
}

struct ActiveRun {
    task_id: TaskId,
    file_name: String,
    cancel: CancellationToken,
    handle: JoinHandle<TranscriptionTask>,
}

struct SchedulerLoop {
    commands: mpsc::UnboundedReceiver<Command>,
    task_updates: mpsc::UnboundedReceiver<TranscriptionTask>,
    task_updates_tx: mpsc::UnboundedSender<TranscriptionTask>,
    executor: Arc<Mutex<TranscriptionExecutor>>,
    queue: Vec<TranscriptionTask>,
    active: Option<ActiveRun>,
    activated: bool,
    snapshot: watch::Sender<Vec<TranscriptionTask>>,
    queue_updates: broadcast::Sender<Vec<TranscriptionTask>>,
    transcriptions: broadcast::Sender<Transcription>,
}

async fn wait_for(active: &mut Option<ActiveRun>) -> Result<TranscriptionTask, JoinError> {
    match active {
        Some(run) => (&mut run.handle).await,
        None => std::future::pending().await,
    }
}

impl SchedulerLoop {
    async fn run(mut self) {
        loop {
            self.dispatch_next();

            tokio::select! {
                biased;
                Some(update) = self.task_updates.recv() => self.apply_update(update),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                result = wait_for(&mut self.active), if self.active.is_some() => {
                    self.finish_run(result)
                }
            }
        }

        if let Some(active) = self.active.take() {
            active.cancel.cancel();
        }
        debug!("Task scheduler stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue { task, reply } => {
                let _ = reply.send(self.enqueue(task));
            }
            Command::Cancel { file_name, reply } => {
                let _ = reply.send(self.cancel(&file_name));
            }
            Command::CancelAll { reply } => {
                let _ = reply.send(self.cancel_all());
            }
            Command::Activate => {
                if !self.activated {
                    info!(queued = self.queue.len(), "Task processing activated");
                    self.activated = true;
                }
            }
        }
    }

    fn enqueue(&mut self, task: TranscriptionTask) -> bool {
        if self.queue.iter().any(|queued| queued.file_name == task.file_name) {
            debug!(file = %task.file_name, "Recording already queued, ignoring");
            return false;
        }

        info!(
            task_id = %task.id,
            file = %task.file_name,
            variant = %task.model,
            position = self.queue.len(),
            "Task enqueued"
        );
        self.queue.push(task);
        self.publish();
        true
    }

    fn cancel(&mut self, file_name: &str) -> bool {
        let mut found = false;

        if let Some(active) = &self.active {
            if active.file_name == file_name && !active.cancel.is_cancelled() {
                info!(task_id = %active.task_id, file = %file_name, "Canceling running task");
                active.cancel.cancel();
                found = true;
            }
        }

        let before = self.queue.len();
        self.queue.retain(|task| task.file_name != file_name);
        if self.queue.len() != before {
            debug!(file = %file_name, "Task removed from queue");
            found = true;
            self.publish();
        }

        found
    }

    fn cancel_all(&mut self) -> usize {
        if let Some(active) = &self.active {
            active.cancel.cancel();
        }

        let removed = self.queue.len();
        self.queue.clear();
        if removed > 0 {
            info!(removed, "All tasks canceled");
            self.publish();
        }
        removed
    }

    fn dispatch_next(&mut self) {
        if !self.activated || self.active.is_some() {
            return;
        }
        let Some(task) = self.queue.first().cloned() else {
            return;
        };

        info!(
            task_id = %task.id,
            file = %task.file_name,
            waiting = self.queue.len() - 1,
            "Dispatching task"
        );

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let executor = Arc::clone(&self.executor);
        let updates = self.task_updates_tx.clone();
        let task_id = task.id;
        let file_name = task.file_name.clone();

        let handle = tokio::spawn(async move {
            let mut executor = executor.lock().await;
            executor.process(task, token, updates).await
        });

        self.active = Some(ActiveRun {
            task_id,
            file_name,
            cancel,
            handle,
        });
    }

    fn apply_update(&mut self, task: TranscriptionTask) {
        // Canceled tasks are already gone from the queue
        let Some(index) = self.queue.iter().position(|queued| queued.id == task.id) else {
            return;
        };

        if task.status.is_terminal() {
            self.queue.remove(index);
        } else {
            self.queue[index] = task;
        }
        self.publish();
    }

    fn finish_run(&mut self, result: Result<TranscriptionTask, JoinError>) {
        let Some(active) = self.active.take() else {
            return;
        };

        while let Ok(update) = self.task_updates.try_recv() {
            self.apply_update(update);
        }

        match result {
            Ok(task) => debug!(
                task_id = %task.id,
                status = task.status.as_str(),
                "Run returned"
            ),
            Err(err) => {
                error!(task_id = %active.task_id, error = %err, "Transcription run aborted");
                if let Some(task) = self.queue.iter().find(|task| task.id == active.task_id) {
                    let mut transcription = Transcription::from_task(task);
                    transcription.status = TranscriptionStatus::Error {
                        message: format!("Transcription run aborted: {}", err),
                    };
                    let _ = self.transcriptions.send(transcription);
                }
            }
        }

        if let Some(index) = self.queue.iter().position(|task| task.id == active.task_id) {
            self.queue.remove(index);
            self.publish();
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.queue.clone());
        let _ = self.queue_updates.send(self.queue.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::transcription::cache::ContextCache;
    use crate::transcription::resources::ResourceGate;
    use crate::transcription::context::TranscriptionEvent;
    use crate::transcription::task::{Segment, TranscriptionParameters};
    use crate::transcription::testing::{
        test_catalog, test_storage, FixedMemory, ScriptedProvider, Step, MB,
    };
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        scheduler: TaskScheduler,
        provider: Arc<ScriptedProvider>,
        transcriptions: broadcast::Receiver<Transcription>,
        _dirs: (TempDir, TempDir),
    }

    fn fixture(provider: ScriptedProvider, files: &[&str]) -> Fixture {
        let provider = Arc::new(provider);
        let (catalog, models_dir) = test_catalog(&["small", "large"]);
        let (storage, recordings_dir): (Arc<Storage>, TempDir) = test_storage(files);
        let gate = ResourceGate::new(Arc::new(FixedMemory::new(1_000 * MB)));
        let cache = ContextCache::new(Arc::new(catalog), gate, provider.clone());
        let (tx, rx) = broadcast::channel(256);
        let executor = TranscriptionExecutor::new(cache, storage, tx.clone(), Duration::from_secs(1));

        Fixture {
            scheduler: TaskScheduler::spawn(executor, tx, 64),
            provider,
            transcriptions: rx,
            _dirs: (models_dir, recordings_dir),
        }
    }

    fn task(file: &str) -> TranscriptionTask {
        TranscriptionTask::new(file, "small", TranscriptionParameters::default())
    }

    async fn next_terminal(rx: &mut broadcast::Receiver<Transcription>) -> Transcription {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let transcription = rx.recv().await.unwrap();
                if transcription.status.is_terminal() {
                    return transcription;
                }
            }
        })
        .await
        .expect("timed out waiting for a terminal transcription")
    }

    #[tokio::test]
    async fn test_nothing_runs_before_activation() {
        let fixture = fixture(ScriptedProvider::finishing(), &["a.wav"]);

        assert!(fixture.scheduler.enqueue(task("a.wav")).await);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(fixture.provider.loads(), 0);
        assert_eq!(fixture.scheduler.current_tasks().len(), 1);
        assert_eq!(
            fixture.scheduler.current_tasks()[0].status,
            TranscriptionStatus::NotStarted
        );
    }

    #[tokio::test]
    async fn test_duplicate_file_is_ignored() {
        let fixture = fixture(ScriptedProvider::finishing(), &["a.wav"]);

        assert!(fixture.scheduler.enqueue(task("a.wav")).await);
        assert!(!fixture.scheduler.enqueue(task("a.wav")).await);
        assert_eq!(fixture.scheduler.current_tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_tasks_complete_in_fifo_order() {
        let mut fixture = fixture(ScriptedProvider::finishing(), &["a.wav", "b.wav", "c.wav"]);
        for file in ["a.wav", "b.wav", "c.wav"] {
            fixture.scheduler.enqueue(task(file)).await;
        }
        fixture.scheduler.activate();

        let mut finished = Vec::new();
        for _ in 0..3 {
            finished.push(next_terminal(&mut fixture.transcriptions).await.file_name);
        }

        assert_eq!(finished, vec!["a.wav", "b.wav", "c.wav"]);
        assert_eq!(fixture.provider.max_active(), 1);
        assert_eq!(fixture.provider.loads(), 1);
    }

    #[tokio::test]
    async fn test_canceled_queued_task_never_starts() {
        let mut fixture = fixture(ScriptedProvider::hanging(), &["a.wav", "b.wav"]);
        fixture.scheduler.enqueue(task("a.wav")).await;
        fixture.scheduler.enqueue(task("b.wav")).await;

        assert!(fixture.scheduler.cancel("b.wav").await);
        assert!(fixture.scheduler.cancel("a.wav").await);
        fixture.scheduler.activate();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(fixture.scheduler.current_tasks().is_empty());
        assert_eq!(fixture.provider.loads(), 0);
        assert!(fixture.transcriptions.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_canceling_waiting_task_leaves_running_task_alone() {
        let provider = ScriptedProvider::with_script(vec![
            Step::Sleep(Duration::from_millis(100)),
            Step::Emit(TranscriptionEvent::Finished(vec![Segment::new(0, 1_000, "hello")])),
        ]);
        let mut fixture = fixture(provider, &["a.wav", "b.wav"]);
        fixture.scheduler.enqueue(task("a.wav")).await;
        fixture.scheduler.enqueue(task("b.wav")).await;
        fixture.scheduler.activate();

        let mut seen = Vec::new();
        loop {
            let update = fixture.transcriptions.recv().await.unwrap();
            let running = matches!(update.status, TranscriptionStatus::Progress { .. });
            seen.push(update);
            if running {
                break;
            }
        }
        assert!(fixture.scheduler.cancel("b.wav").await);
        assert_eq!(fixture.scheduler.current_tasks().len(), 1);

        let done = next_terminal(&mut fixture.transcriptions).await;
        assert_eq!(done.file_name, "a.wav");
        assert!(matches!(done.status, TranscriptionStatus::Done { .. }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        while let Ok(update) = fixture.transcriptions.try_recv() {
            seen.push(update);
        }
        assert!(seen.iter().all(|update| update.file_name == "a.wav"));
        assert!(fixture.scheduler.current_tasks().is_empty());
        assert_eq!(fixture.provider.transcribe_calls(), 1);
    }

    #[tokio::test]
    async fn test_panicking_run_is_reported_and_queue_moves_on() {
        let provider = ScriptedProvider::finishing().panicking_on("a.wav");
        let mut fixture = fixture(provider, &["a.wav", "b.wav"]);
        fixture.scheduler.enqueue(task("a.wav")).await;
        fixture.scheduler.enqueue(task("b.wav")).await;
        fixture.scheduler.activate();

        let failed = next_terminal(&mut fixture.transcriptions).await;
        assert_eq!(failed.file_name, "a.wav");
        match failed.status {
            TranscriptionStatus::Error { message } => {
                assert!(message.starts_with("Transcription run aborted"), "{message}")
            }
            other => panic!("expected error, got {other:?}"),
        }

        let done = next_terminal(&mut fixture.transcriptions).await;
        assert_eq!(done.file_name, "b.wav");
        assert!(matches!(done.status, TranscriptionStatus::Done { .. }));

        tokio::time::timeout(Duration::from_secs(1), async {
            while !fixture.scheduler.current_tasks().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("queue should drain after a panicked run");
        assert_eq!(fixture.provider.transcribe_calls(), 2);
        assert_eq!(fixture.provider.loads(), 1);
    }

    #[tokio::test]
    async fn test_cancel_unknown_file_reports_nothing_found() {
        let fixture = fixture(ScriptedProvider::finishing(), &[]);
        assert!(!fixture.scheduler.cancel("nope.wav").await);
    }

    #[tokio::test]
    async fn test_cancel_all_empties_queue() {
        let mut fixture = fixture(ScriptedProvider::hanging(), &["a.wav", "b.wav", "c.wav"]);
        for file in ["a.wav", "b.wav", "c.wav"] {
            fixture.scheduler.enqueue(task(file)).await;
        }
        fixture.scheduler.activate();

        // Wait for the first task to reach the engine
        loop {
            let update = fixture.transcriptions.recv().await.unwrap();
            if matches!(update.status, TranscriptionStatus::Progress { .. }) {
                break;
            }
        }

        assert_eq!(fixture.scheduler.cancel_all().await, 3);
        let last = next_terminal(&mut fixture.transcriptions).await;

        assert_eq!(last.file_name, "a.wav");
        assert_eq!(last.status, TranscriptionStatus::Canceled);
        assert!(fixture.scheduler.current_tasks().is_empty());
        assert_eq!(fixture.provider.transcribe_calls(), 1);
    }

    #[tokio::test]
    async fn test_resume_handle_activates_processing() {
        let mut fixture = fixture(ScriptedProvider::finishing(), &["a.wav"]);
        fixture.scheduler.enqueue(task("a.wav")).await;

        fixture.scheduler.resume_handle().resume();

        let done = next_terminal(&mut fixture.transcriptions).await;
        assert!(matches!(done.status, TranscriptionStatus::Done { .. }));
    }

    #[tokio::test]
    async fn test_queue_updates_follow_task_lifecycle() {
        let fixture = fixture(ScriptedProvider::finishing(), &["a.wav"]);
        let mut updates = fixture.scheduler.subscribe();

        fixture.scheduler.enqueue(task("a.wav")).await;
        fixture.scheduler.activate();

        let mut saw_running = false;
        let emptied = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = updates.recv().await.unwrap();
                if snapshot
                    .iter()
                    .any(|task| matches!(task.status, TranscriptionStatus::Progress { .. }))
                {
                    saw_running = true;
                }
                if snapshot.is_empty() {
                    return true;
                }
            }
        })
        .await
        .unwrap();

        assert!(emptied);
        assert!(saw_running);
    }
}
