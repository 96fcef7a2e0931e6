//! # Application State
//!
//! Everything HTTP handlers and WebSocket actors share. One `AppState` is
//! built in `main` and cloned into every actix worker thread.
//!
//! ## Sharing Pattern:
//! - **Arc**: the worker, storage and configuration are owned once and
//!   referenced from every handler
//! - **Clone**: cloning `AppState` only bumps reference counts
//! - The worker does its own synchronization (its scheduler is an actor),
//!   so no lock is needed around it here

use std::sync::Arc;
use std::time::Instant;

use crate::config::AppConfig;
use crate::storage::Storage;
use crate::transcription::{ResourceGate, TranscriptionWorker};

#[derive(Clone)]
pub struct AppState {
    /// Read-only after startup
    pub config: Arc<AppConfig>,
    pub worker: Arc<TranscriptionWorker>,
    pub storage: Arc<Storage>,
    /// Same probe the worker admits loads with, used for reporting
    pub gate: ResourceGate,
    /// Compute device the engine runs on ("cpu", "cuda", "metal")
    pub device: &'static str,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        worker: Arc<TranscriptionWorker>,
        storage: Arc<Storage>,
        gate: ResourceGate,
        device: &'static str,
    ) -> Self {
        Self {
            config: Arc::new(config),
            worker,
            storage,
            gate,
            device,
            start_time: Instant::now(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
