//! # Transcription Module
//!
//! Queues speech-to-text jobs for recordings and runs them one at a time
//! against a local model, under the memory the machine has to spare.
//!
//! ## Key Components:
//! - **catalog**: Known model variants, their memory needs and on-disk location
//! - **resources**: Memory probe and the admission check run before each load
//! - **context**: The inference engine contract (contexts, events, providers)
//! - **cache**: Keeps the last loaded context for reuse
//! - **executor**: Runs one task and publishes its progress
//! - **scheduler**: The FIFO queue and its single processing loop
//! - **worker**: Facade used by HTTP handlers and the WebSocket

pub mod cache;
pub mod catalog;
pub mod context;
pub mod executor;
pub mod resources;
pub mod scheduler;
pub mod task;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::ModelCatalog;
pub use context::{ContextProvider, VoiceLanguage};
pub use resources::{MemoryProbe, ResourceGate, SystemMemory};
pub use scheduler::ResidentProcess;
pub use task::{Segment, Transcription, TranscriptionParameters, TranscriptionStatus, TranscriptionTask};
pub use worker::TranscriptionWorker;
