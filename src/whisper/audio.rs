//! # Audio Preparation
//!
//! Turns a WAV recording into what the Whisper encoder expects:
//! mono 32-bit float samples at 16kHz, in the range [-1.0, 1.0].
//!
//! ## Supported Input:
//! - 8, 16 and 24-bit integer PCM, 32-bit float PCM
//! - Any channel count (mixed down to mono)
//! - Any sample rate (linearly resampled)

use anyhow::{anyhow, Context, Result};
use candle_transformers::models::whisper as m;
use std::fs::File;
use std::path::Path;
use tracing::debug;
use wav::BitDepth;

/// Read a WAV file as mono samples at Whisper's sample rate.
pub fn load_wav(path: &Path) -> Result<Vec<f32>> {
    let mut file = File::open(path)
        .with_context(|| format!("Failed to open audio file {}", path.display()))?;
    let (header, data) = wav::read(&mut file)
        .map_err(|e| anyhow!("Unreadable WAV file {}: {}", path.display(), e))?;

    let samples = pcm_to_float(data);
    let mono = downmix(&samples, header.channel_count as usize);
    let resampled = resample_linear(&mono, header.sampling_rate, m::SAMPLE_RATE as u32);

    debug!(
        path = %path.display(),
        channels = header.channel_count,
        sample_rate = header.sampling_rate,
        seconds = resampled.len() as f64 / m::SAMPLE_RATE as f64,
        "Audio decoded"
    );
    Ok(resampled)
}

fn pcm_to_float(data: BitDepth) -> Vec<f32> {
    match data {
        BitDepth::Eight(samples) => samples
            .into_iter()
            .map(|sample| (sample as f32 - 128.0) / 128.0)
            .collect(),
        BitDepth::Sixteen(samples) => samples
            .into_iter()
            .map(|sample| sample as f32 / 32768.0)
            .collect(),
        BitDepth::TwentyFour(samples) => samples
            .into_iter()
            .map(|sample| sample as f32 / 8_388_608.0)
            .collect(),
        BitDepth::ThirtyTwoFloat(samples) => samples,
        BitDepth::Empty => Vec::new(),
    }
}

/// Average interleaved channels into one.
pub fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (samples.len() as f64 / ratio).floor() as usize;
    (0..out_len)
        .map(|i| {
            let position = i as f64 * ratio;
            let index = position.floor() as usize;
            let fraction = (position - index as f64) as f32;
            let current = samples[index];
            let next = samples.get(index + 1).copied().unwrap_or(current);
            current + (next - current) * fraction
        })
        .collect()
}

/// Triangular mel filter bank on the Slaney mel scale, `n_mels` rows of
/// `n_fft / 2 + 1` frequency bins each.
pub fn mel_filters(n_mels: usize, n_fft: usize, sample_rate: f32) -> Vec<f32> {
    let n_freqs = n_fft / 2 + 1;
    let mel_max = hz_to_mel(sample_rate / 2.0);
    let edges: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_max * i as f32 / (n_mels + 1) as f32))
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_freqs];
    for mel in 0..n_mels {
        let (lower, center, upper) = (edges[mel], edges[mel + 1], edges[mel + 2]);
        let norm = 2.0 / (upper - lower);
        for bin in 0..n_freqs {
            let freq = bin as f32 * sample_rate / n_fft as f32;
            let rising = (freq - lower) / (center - lower);
            let falling = (upper - freq) / (upper - center);
            filters[mel * n_freqs + bin] = rising.min(falling).max(0.0) * norm;
        }
    }
    filters
}

const F_SP: f32 = 200.0 / 3.0;
const MIN_LOG_HZ: f32 = 1000.0;
const MIN_LOG_MEL: f32 = MIN_LOG_HZ / F_SP;

fn log_step() -> f32 {
    6.4f32.ln() / 27.0
}

fn hz_to_mel(hz: f32) -> f32 {
    if hz >= MIN_LOG_HZ {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step()
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f32) -> f32 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    } else {
        F_SP * mel
    }
}
