//! # Whisper Engine
//!
//! Local speech recognition with candle's Whisper implementation, exposed to
//! the worker as a [`ContextProvider`].
//!
//! ## Key Components:
//! - **audio**: WAV decoding, resampling and the mel filter bank
//! - **device**: CPU / CUDA / Metal selection
//! - **languages**: The language table of multilingual checkpoints
//! - **model**: Weights, greedy decoding and the inference context

pub mod audio;
pub mod device;
pub mod languages;
pub mod model;

use async_trait::async_trait;
use candle_core::Device;
use std::sync::Arc;
use tracing::{error, info};

use crate::error::WorkerError;
use crate::transcription::catalog::ModelVariant;
use crate::transcription::context::{ContextProvider, InferenceContext, VoiceLanguage};

pub use device::DevicePreference;
use model::{WhisperContext, WhisperModel};

pub struct WhisperProvider {
    device: Device,
}

impl WhisperProvider {
    pub fn new(preference: DevicePreference) -> Self {
        let device = device::select_device(preference);
        info!(device = device::describe(&device), "Whisper provider ready");
        Self { device }
    }

    pub fn device_name(&self) -> &'static str {
        device::describe(&self.device)
    }
}

#[async_trait]
impl ContextProvider for WhisperProvider {
    async fn load(&self, variant: &ModelVariant) -> Result<Arc<dyn InferenceContext>, WorkerError> {
        let dir = variant.local_path.clone();
        let device = self.device.clone();
        // English-only checkpoints carry no language tokens
        let multilingual = !variant.id.ends_with(".en");
        let variant_id = variant.id.clone();

        let loaded = tokio::task::spawn_blocking(move || WhisperModel::load(&dir, device, multilingual))
            .await
            .map_err(|e| WorkerError::ModelLoad {
                variant: variant_id.clone(),
                message: format!("Loader task failed: {}", e),
            })?;

        match loaded {
            Ok(model) => Ok(Arc::new(WhisperContext::new(variant_id, model))),
            Err(e) => {
                error!(variant = %variant_id, "Failed to load Whisper model: {:#}", e);
                Err(WorkerError::ModelLoad {
                    variant: variant_id,
                    message: e.to_string(),
                })
            }
        }
    }

    fn available_languages(&self) -> Vec<VoiceLanguage> {
        languages::LANGUAGES
            .iter()
            .map(|(code, name)| VoiceLanguage::new(*code, *name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_weights_is_a_load_error() {
        let dir = TempDir::new().unwrap();
        let variant = ModelVariant::new("tiny", "test", 39, 1, dir.path());
        let provider = WhisperProvider::new(DevicePreference::Cpu);

        match provider.load(&variant).await {
            Err(WorkerError::ModelLoad { variant, .. }) => assert_eq!(variant, "tiny"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("empty directory should not load"),
        }
    }

    #[test]
    fn test_languages_come_from_table() {
        let provider = WhisperProvider::new(DevicePreference::Cpu);
        let languages = provider.available_languages();
        assert_eq!(languages.len(), languages::LANGUAGES.len());
        assert_eq!(languages[0], VoiceLanguage::new("en", "English"));
        assert_eq!(provider.device_name(), "cpu");
    }
}
