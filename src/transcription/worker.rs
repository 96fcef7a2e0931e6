//! # Transcription Worker
//!
//! The single entry point the rest of the application uses: enqueue and
//! cancel work, list tasks and languages, and subscribe to updates.
//!
//! ## Activation:
//! The scheduler does not pull tasks until someone subscribes to
//! [`TranscriptionWorker::transcription_updates`]. The subscription is made
//! before activation, so the first subscriber sees every update.

use futures_util::future;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use crate::config::WorkerConfig;
use crate::storage::Storage;
use crate::transcription::cache::ContextCache;
use crate::transcription::catalog::ModelCatalog;
use crate::transcription::context::{ContextProvider, VoiceLanguage};
use crate::transcription::executor::TranscriptionExecutor;
use crate::transcription::resources::ResourceGate;
use crate::transcription::scheduler::{BackgroundExecution, TaskScheduler};
use crate::transcription::task::{Transcription, TranscriptionTask};

pub struct TranscriptionWorker {
    scheduler: TaskScheduler,
    transcriptions: broadcast::Sender<Transcription>,
    catalog: Arc<ModelCatalog>,
    provider: Arc<dyn ContextProvider>,
    background: Arc<dyn BackgroundExecution>,
}

impl TranscriptionWorker {
    /// Wire up the cache, executor and scheduler. Must run inside a Tokio runtime.
    pub fn new(
        config: &WorkerConfig,
        catalog: Arc<ModelCatalog>,
        gate: ResourceGate,
        provider: Arc<dyn ContextProvider>,
        storage: Arc<Storage>,
        background: Arc<dyn BackgroundExecution>,
    ) -> Self {
        let (transcriptions, _) = broadcast::channel(config.update_channel_capacity);
        let cache = ContextCache::new(Arc::clone(&catalog), gate, Arc::clone(&provider));
        let executor = TranscriptionExecutor::new(
            cache,
            storage,
            transcriptions.clone(),
            config.cancel_grace(),
        );
        let scheduler = TaskScheduler::spawn(
            executor,
            transcriptions.clone(),
            config.update_channel_capacity,
        );

        Self {
            scheduler,
            transcriptions,
            catalog,
            provider,
            background,
        }
    }

    pub async fn enqueue(&self, task: TranscriptionTask) -> bool {
        self.scheduler.enqueue(task).await
    }

    pub async fn cancel(&self, file_name: &str) -> bool {
        self.scheduler.cancel(file_name).await
    }

    pub async fn cancel_all(&self) -> usize {
        self.scheduler.cancel_all().await
    }

    /// Future transcription updates. Also starts task processing.
    pub fn transcription_updates(&self) -> BoxStream<'static, Transcription> {
        let receiver = self.transcriptions.subscribe();
        self.scheduler.activate();
        skip_lagged(receiver, "transcription")
    }

    /// Future queue snapshots.
    pub fn queue_updates(&self) -> BoxStream<'static, Vec<TranscriptionTask>> {
        skip_lagged(self.scheduler.subscribe(), "queue")
    }

    pub fn current_tasks(&self) -> Vec<TranscriptionTask> {
        self.scheduler.current_tasks()
    }

    /// `auto` followed by every language the engine supports.
    pub fn available_languages(&self) -> Vec<VoiceLanguage> {
        let mut languages = vec![VoiceLanguage::auto()];
        languages.extend(self.provider.available_languages());
        languages
    }

    pub fn register_for_background_continuation(&self) {
        self.background.register(self.scheduler.resume_handle());
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }
}

fn skip_lagged<T: Clone + Send + 'static>(
    receiver: broadcast::Receiver<T>,
    channel: &'static str,
) -> BoxStream<'static, T> {
    BroadcastStream::new(receiver)
        .filter_map(move |item| {
            future::ready(match item {
                Ok(value) => Some(value),
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    warn!(channel, missed, "Update subscriber lagged, skipping updates");
                    None
                }
            })
        })
        .boxed()
}
