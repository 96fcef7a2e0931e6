//! # Whisper Model
//!
//! A candle Whisper model loaded from a local variant directory, and the
//! [`InferenceContext`] that streams its output.
//!
//! ## Variant Directory Layout:
//! - `config.json`: model hyper-parameters
//! - `tokenizer.json`: tokenizer with Whisper's special tokens
//! - `model.safetensors`: weights
//!
//! ## Decoding:
//! Audio is cut into 30 second windows. Each window is encoded once and
//! decoded greedily into one segment. The cancel flag is checked before every
//! window and every token, so a cancel takes effect within one decoder step.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use candle_core::{Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, audio, Config};
use futures_util::StreamExt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokenizers::Tokenizer;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::error::WorkerError;
use crate::transcription::context::{EventStream, InferenceContext, TranscriptionEvent};
use crate::transcription::task::{Segment, TranscriptionParameters};
use crate::whisper::audio::{load_wav, mel_filters};
use crate::whisper::languages::LANGUAGES;

/// Ids of the special tokens the decoder prompt is built from.
struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    translate: u32,
    no_timestamps: u32,
    start_of_prev: Option<u32>,
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| anyhow!("Tokenizer has no '{}' token", token))
}

pub struct WhisperModel {
    model: m::model::Whisper,
    config: Config,
    tokenizer: Tokenizer,
    device: Device,
    mel_filters: Vec<f32>,
    suppress: Tensor,
    tokens: SpecialTokens,
    /// (code, token id) for every language the tokenizer knows
    language_tokens: Vec<(&'static str, u32)>,
    multilingual: bool,
}

impl WhisperModel {
    pub fn load(dir: &Path, device: Device, multilingual: bool) -> Result<Self> {
        let started = Instant::now();

        let config: Config = serde_json::from_reader(File::open(dir.join("config.json"))?)?;
        let tokenizer = Tokenizer::from_file(dir.join("tokenizer.json"))
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        let weights = dir.join("model.safetensors");
        if !weights.exists() {
            return Err(anyhow!("Missing weights file {}", weights.display()));
        }
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], m::DTYPE, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        let tokens = SpecialTokens {
            sot: token_id(&tokenizer, m::SOT_TOKEN)?,
            eot: token_id(&tokenizer, m::EOT_TOKEN)?,
            transcribe: token_id(&tokenizer, m::TRANSCRIBE_TOKEN)?,
            translate: token_id(&tokenizer, m::TRANSLATE_TOKEN)?,
            no_timestamps: token_id(&tokenizer, m::NO_TIMESTAMPS_TOKEN)?,
            start_of_prev: tokenizer.token_to_id("<|startofprev|>"),
        };

        let language_tokens = LANGUAGES
            .iter()
            .filter_map(|(code, _)| {
                tokenizer
                    .token_to_id(&format!("<|{}|>", code))
                    .map(|id| (*code, id))
            })
            .collect();

        let suppress: Vec<f32> = (0..config.vocab_size as u32)
            .map(|id| {
                if config.suppress_tokens.contains(&id) {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
            .collect();
        let suppress = Tensor::new(suppress.as_slice(), &device)?;

        let mel_filters = mel_filters(config.num_mel_bins, m::N_FFT, m::SAMPLE_RATE as f32);

        info!(
            dir = %dir.display(),
            mel_bins = config.num_mel_bins,
            load_secs = started.elapsed().as_secs_f64(),
            "Whisper weights loaded"
        );

        Ok(Self {
            model,
            config,
            tokenizer,
            device,
            mel_filters,
            suppress,
            tokens,
            language_tokens,
            multilingual,
        })
    }

    /// Transcribe 16kHz mono samples. `emit` returns false once nobody is listening.
    ///
    /// Returns `None` when the run was canceled.
    pub fn transcribe(
        &mut self,
        pcm: &[f32],
        parameters: &TranscriptionParameters,
        cancel: &AtomicBool,
        mut emit: impl FnMut(TranscriptionEvent) -> bool,
    ) -> Result<Option<Vec<Segment>>> {
        let n_mels = self.config.num_mel_bins;
        let mel = audio::pcm_to_mel(&self.config, pcm, &self.mel_filters);
        let mel_frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, mel_frames), &self.device)?;

        let content_frames = (pcm.len() / m::HOP_LENGTH).min(mel_frames);
        let mut language: Option<Option<u32>> = None;
        let mut segments = Vec::new();
        let mut seek = 0;

        while seek < content_frames {
            if cancel.load(Ordering::SeqCst) {
                return Ok(None);
            }

            let window_frames = (content_frames - seek).min(m::N_FRAMES);
            let window = mel.narrow(2, seek, window_frames)?;
            let audio_features = self.model.encoder.forward(&window, true)?;

            let language_token = match language {
                Some(resolved) => resolved,
                None => {
                    let resolved = self.language_token(parameters, &audio_features)?;
                    language = Some(resolved);
                    resolved
                }
            };

            let prompt = self.prompt_tokens(parameters, language_token)?;
            let Some(text) = self.decode_window(&audio_features, prompt, cancel)? else {
                return Ok(None);
            };

            let start_ms = parameters.offset_ms + frames_to_ms(seek);
            seek += window_frames;
            let end_ms = parameters.offset_ms + frames_to_ms(seek);

            if !text.is_empty() {
                let segment = Segment::new(start_ms, end_ms, text);
                debug!(start_ms, end_ms, text = %segment.text, "Window decoded");
                segments.push(segment.clone());
                if !emit(TranscriptionEvent::NewSegment(segment)) {
                    return Ok(None);
                }
            }

            if !emit(TranscriptionEvent::Progress(seek as f64 / content_frames as f64)) {
                return Ok(None);
            }
        }

        Ok(Some(segments))
    }

    /// Language token for the run, detected from the first window when not given.
    fn language_token(
        &mut self,
        parameters: &TranscriptionParameters,
        audio_features: &Tensor,
    ) -> Result<Option<u32>> {
        if !self.multilingual {
            return Ok(None);
        }

        match parameters.language.as_deref().filter(|code| *code != "auto") {
            Some(code) => {
                let token = self
                    .language_tokens
                    .iter()
                    .find(|(known, _)| *known == code)
                    .map(|(_, id)| *id);
                if token.is_none() {
                    warn!(language = code, "Unsupported language, detecting instead");
                    return self.detect_language(audio_features);
                }
                Ok(token)
            }
            None => self.detect_language(audio_features),
        }
    }

    fn detect_language(&mut self, audio_features: &Tensor) -> Result<Option<u32>> {
        if self.language_tokens.is_empty() {
            return Ok(None);
        }

        let tokens = Tensor::new(&[self.tokens.sot], &self.device)?.unsqueeze(0)?;
        let ys = self.model.decoder.forward(&tokens, audio_features, true)?;
        let logits: Vec<f32> = self.model.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?.to_vec1()?;

        let detected = self
            .language_tokens
            .iter()
            .filter(|(_, id)| (*id as usize) < logits.len())
            .max_by(|(_, a), (_, b)| logits[*a as usize].total_cmp(&logits[*b as usize]))
            .copied();

        if let Some((code, _)) = detected {
            info!(language = code, "Language detected");
        }
        Ok(detected.map(|(_, id)| id))
    }

    fn prompt_tokens(
        &self,
        parameters: &TranscriptionParameters,
        language: Option<u32>,
    ) -> Result<Vec<u32>> {
        let mut tokens = Vec::new();

        if let (Some(prompt), Some(start_of_prev)) =
            (parameters.initial_prompt.as_deref(), self.tokens.start_of_prev)
        {
            let encoding = self
                .tokenizer
                .encode(format!(" {}", prompt.trim()), false)
                .map_err(|e| anyhow!("Failed to tokenize prompt: {}", e))?;
            let ids = encoding.get_ids();
            // Most recent prompt tokens only, leaving room for the output
            let keep = ids.len().min(self.config.max_target_positions / 2 - 1);
            tokens.push(start_of_prev);
            tokens.extend_from_slice(&ids[ids.len() - keep..]);
        }

        tokens.push(self.tokens.sot);
        if let Some(language) = language {
            tokens.push(language);
        }
        tokens.push(if parameters.translate {
            self.tokens.translate
        } else {
            self.tokens.transcribe
        });
        tokens.push(self.tokens.no_timestamps);
        Ok(tokens)
    }

    /// Greedy decode of one window. `None` when canceled mid-window.
    fn decode_window(
        &mut self,
        audio_features: &Tensor,
        mut tokens: Vec<u32>,
        cancel: &AtomicBool,
    ) -> Result<Option<String>> {
        let prompt_len = tokens.len();
        let max_len = self.config.max_target_positions;

        for step in 0..max_len / 2 {
            if cancel.load(Ordering::SeqCst) {
                return Ok(None);
            }

            let input = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = self.model.decoder.forward(&input, audio_features, step == 0)?;
            let (_, seq_len, _) = ys.dims3()?;
            let logits = self
                .model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?
                .broadcast_add(&self.suppress)?;

            let next = argmax(&logits.to_vec1::<f32>()?);
            if next == self.tokens.eot || tokens.len() >= max_len {
                break;
            }
            if is_repetitive(&tokens[prompt_len..], next) {
                debug!("Repetition detected, closing window early");
                break;
            }
            tokens.push(next);
        }

        let text = self
            .tokenizer
            .decode(&tokens[prompt_len..], true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;
        Ok(Some(text.trim().to_string()))
    }
}

fn frames_to_ms(frames: usize) -> u64 {
    (frames * m::HOP_LENGTH * 1000 / m::SAMPLE_RATE) as u64
}

fn argmax(values: &[f32]) -> u32 {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(index, _)| index as u32)
        .unwrap_or(0)
}

/// Same token three times in a row, or the last three tokens repeating.
fn is_repetitive(tokens: &[u32], next: u32) -> bool {
    let len = tokens.len();
    if len >= 3 && tokens[len - 3..].iter().all(|token| *token == next) {
        return true;
    }
    len >= 6 && tokens[len - 3..] == tokens[len - 6..len - 3] && tokens[len - 3] == next
}

/// An [`InferenceContext`] backed by one loaded [`WhisperModel`].
pub struct WhisperContext {
    variant: String,
    model: Arc<Mutex<WhisperModel>>,
    cancel_flag: Mutex<Option<Arc<AtomicBool>>>,
}

impl WhisperContext {
    pub fn new(variant: impl Into<String>, model: WhisperModel) -> Self {
        Self {
            variant: variant.into(),
            model: Arc::new(Mutex::new(model)),
            cancel_flag: Mutex::new(None),
        }
    }
}

#[async_trait]
impl InferenceContext for WhisperContext {
    async fn full_transcribe(
        &self,
        audio_path: &Path,
        parameters: &TranscriptionParameters,
    ) -> Result<EventStream, WorkerError> {
        let canceled = Arc::new(AtomicBool::new(false));
        *self
            .cancel_flag
            .lock()
            .map_err(|_| WorkerError::Engine("Cancel flag lock poisoned".to_string()))? =
            Some(Arc::clone(&canceled));

        let (tx, rx) = mpsc::channel(32);
        let model = Arc::clone(&self.model);
        let path: PathBuf = audio_path.to_path_buf();
        let parameters = parameters.clone();
        let variant = self.variant.clone();

        tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let outcome = run_transcription(&model, &path, &parameters, &canceled, &tx);
            let terminal = match outcome {
                Ok(Some(segments)) => TranscriptionEvent::Finished(segments),
                Ok(None) => TranscriptionEvent::Canceled,
                Err(err) => TranscriptionEvent::Error(err.to_string()),
            };
            info!(
                variant = %variant,
                path = %path.display(),
                secs = started.elapsed().as_secs_f64(),
                "Whisper run ended"
            );
            let _ = tx.blocking_send(terminal);
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    fn cancel(&self) {
        if let Ok(flag) = self.cancel_flag.lock() {
            if let Some(flag) = flag.as_ref() {
                flag.store(true, Ordering::SeqCst);
            }
        }
    }
}

fn run_transcription(
    model: &Mutex<WhisperModel>,
    path: &Path,
    parameters: &TranscriptionParameters,
    canceled: &AtomicBool,
    events: &mpsc::Sender<TranscriptionEvent>,
) -> Result<Option<Vec<Segment>>> {
    let pcm = load_wav(path)?;
    let offset = (parameters.offset_ms as usize * m::SAMPLE_RATE) / 1000;
    let pcm = pcm.get(offset..).unwrap_or(&[]);
    if pcm.is_empty() {
        return Ok(Some(Vec::new()));
    }

    let mut model = model
        .lock()
        .map_err(|_| anyhow!("Whisper model lock poisoned"))?;
    model.transcribe(pcm, parameters, canceled, |event| {
        events.blocking_send(event).is_ok()
    })
}
