//! # Whisper Engine
//!
//! Speech-to-text on OpenAI Whisper checkpoints, run with Candle. Model files are
//! fetched from HuggingFace (and cached) when the service starts.
//!
//! ## Pipeline per window:
//! 1. Log-mel spectrogram (Slaney filterbank computed at load time)
//! 2. Encoder pass over at most 30 seconds of audio
//! 3. Language token: the requested one, or the most likely one when auto-detecting
//! 4. Greedy decoding until end-of-text or `max_tokens`
//!
//! Confidence is the mean probability of the chosen tokens. Windows the model
//! classifies as silence return empty text.

use crate::error::EngineError;
use crate::transcription::engine::{TranscriptionEngine, TranscriptionOutput};
use anyhow::{anyhow, Result};
use candle_core::{Device, IndexOp, Tensor, D};
use candle_nn::{ops::softmax, VarBuilder};
use candle_transformers::models::whisper::{self as m, Config};
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tokenizers::Tokenizer;

/// Above this no-speech probability (with low average log-probability) a window is silence.
const NO_SPEECH_THRESHOLD: f64 = 0.6;
const LOGPROB_THRESHOLD: f64 = -1.0;

/// Available Whisper model sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    /// HuggingFace repository holding the checkpoint.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::Large => "openai/whisper-large-v2",
        }
    }
}

impl std::str::FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            _ => Err(anyhow!("Unknown model size: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        };
        f.write_str(name)
    }
}

/// Special token ids resolved from the tokenizer.
#[derive(Debug, Clone)]
struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    no_timestamps: u32,
    no_speech: Option<u32>,
    /// Every `<|xx|>` language token in the vocabulary
    languages: Vec<u32>,
}

impl SpecialTokens {
    fn resolve(tokenizer: &Tokenizer) -> Result<Self> {
        let id = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| anyhow!("Tokenizer has no {} token", token))
        };

        let no_speech = m::NO_SPEECH_TOKENS
            .iter()
            .find_map(|token| tokenizer.token_to_id(token));

        let mut languages: Vec<u32> = tokenizer
            .get_vocab(true)
            .into_iter()
            .filter(|(token, _)| is_language_token(token))
            .map(|(_, id)| id)
            .collect();
        languages.sort_unstable();

        Ok(Self {
            sot: id(m::SOT_TOKEN)?,
            eot: id(m::EOT_TOKEN)?,
            transcribe: id(m::TRANSCRIBE_TOKEN)?,
            no_timestamps: id(m::NO_TIMESTAMPS_TOKEN)?,
            no_speech,
            languages,
        })
    }
}

/// `<|en|>`, `<|yo|>`, `<|haw|>` and so on.
fn is_language_token(token: &str) -> bool {
    token
        .strip_prefix("<|")
        .and_then(|rest| rest.strip_suffix("|>"))
        .map(|code| (2..=3).contains(&code.len()) && code.chars().all(|c| c.is_ascii_lowercase()))
        .unwrap_or(false)
}

/// Result of one greedy decode.
struct Decoded {
    tokens: Vec<u32>,
    avg_logprob: f64,
    mean_probability: f64,
    no_speech_prob: f64,
}

/// A loaded Whisper checkpoint implementing `TranscriptionEngine`.
pub struct WhisperEngine {
    model: Mutex<m::model::Whisper>,
    config: Config,
    tokenizer: Tokenizer,
    tokens: SpecialTokens,
    mel_filters: Vec<f32>,
    suppress: Tensor,
    device: Device,
    size: ModelSize,
    max_tokens: usize,
}

impl WhisperEngine {
    /// Download (or reuse cached) model files and load them onto `device`.
    ///
    /// ## Environment:
    /// - **HF_TOKEN**: optional HuggingFace token
    /// - **HF_HUB_CACHE** / **HF_HOME**: cache location overrides
    pub async fn load(size: ModelSize, device: Device, max_tokens: usize) -> Result<Self> {
        tracing::info!("Loading Whisper {} model...", size);
        let start_time = Instant::now();

        let api = {
            use hf_hub::api::tokio::ApiBuilder;

            let mut builder = ApiBuilder::new()
                .with_token(std::env::var("HF_TOKEN").ok())
                .with_progress(false);
            if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
                builder = builder.with_cache_dir(cache_dir.into());
            } else if let Ok(hf_home) = std::env::var("HF_HOME") {
                builder = builder.with_cache_dir(std::path::PathBuf::from(hf_home).join("hub"));
            }
            builder
                .build()
                .map_err(|e| anyhow!("Failed to initialize HuggingFace API: {}", e))?
        };

        let repo = api.model(size.repo_name().to_string());
        let download_error = |file: &str, e: hf_hub::api::tokio::ApiError| {
            anyhow!("Failed to download {} from {}: {}", file, size.repo_name(), e)
        };

        let config_file = repo
            .get("config.json")
            .await
            .map_err(|e| download_error("config.json", e))?;
        let tokenizer_file = repo
            .get("tokenizer.json")
            .await
            .map_err(|e| download_error("tokenizer.json", e))?;
        let weights_file = repo
            .get("model.safetensors")
            .await
            .map_err(|e| download_error("model.safetensors", e))?;
        tracing::debug!("Model files available at {:?}", weights_file.parent());

        let config: Config = serde_json::from_reader(std::fs::File::open(config_file)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        let tokens = SpecialTokens::resolve(&tokenizer)?;

        // SAFETY: the weights file is owned by the HuggingFace cache and not modified while mapped
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_file], m::DTYPE, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        let mel_filters = mel_filter_bank(config.num_mel_bins, m::N_FFT, m::SAMPLE_RATE as f32);
        let suppress = suppress_mask(&config, &tokens, &device)?;

        let engine = Self {
            model: Mutex::new(model),
            config,
            tokenizer,
            tokens,
            mel_filters,
            suppress,
            device,
            size,
            max_tokens: max_tokens.max(1),
        };

        tracing::info!(
            "Whisper {} model loaded in {:.2}s ({} language tokens)",
            size,
            start_time.elapsed().as_secs_f64(),
            engine.tokens.languages.len()
        );

        engine.warm_up()?;
        Ok(engine)
    }

    /// Run one second of silence through the model so the first real window is not slow.
    fn warm_up(&self) -> Result<()> {
        let output = self.run(&vec![0.0f32; m::SAMPLE_RATE], Some("en"))?;
        tracing::debug!("Model warm-up result: '{}'", output.text);
        Ok(())
    }

    fn run(&self, samples: &[f32], language: Option<&str>) -> Result<TranscriptionOutput> {
        if samples.is_empty() {
            return Err(anyhow!("Audio data is empty"));
        }

        let start_time = Instant::now();
        let samples = &samples[..samples.len().min(m::N_SAMPLES)];
        let mel = self.log_mel(samples)?;

        let language_token = match language {
            Some(code) => {
                let token = self.tokenizer.token_to_id(&format!("<|{}|>", code));
                if token.is_none() {
                    tracing::debug!("Model has no token for language '{}', auto-detecting", code);
                }
                token
            }
            None => None,
        };

        let mut model = self.model.lock().unwrap_or_else(PoisonError::into_inner);
        let features = model.encoder.forward(&mel, true)?;
        let language_token = match language_token {
            Some(token) => Some(token),
            None => self.detect_language(&mut model, &features)?,
        };
        let decoded = self.decode(&mut model, &features, language_token)?;
        drop(model);

        if decoded.no_speech_prob > NO_SPEECH_THRESHOLD && decoded.avg_logprob < LOGPROB_THRESHOLD {
            tracing::debug!(
                "Window classified as silence (no_speech_prob {:.2})",
                decoded.no_speech_prob
            );
            return Ok(TranscriptionOutput::new("", None));
        }

        let text = self
            .tokenizer
            .decode(&decoded.tokens, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;

        tracing::debug!(
            "Transcribed {:.2}s of audio in {:.2}s",
            samples.len() as f64 / m::SAMPLE_RATE as f64,
            start_time.elapsed().as_secs_f64()
        );

        Ok(TranscriptionOutput::new(
            text.trim(),
            Some(decoded.mean_probability as f32),
        ))
    }

    /// Mel spectrogram shaped `(1, n_mels, frames)` with at most one segment of frames.
    fn log_mel(&self, samples: &[f32]) -> Result<Tensor> {
        let mel = m::audio::pcm_to_mel(&self.config, samples, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, frames), &self.device)?;
        Ok(mel.narrow(2, 0, frames.min(m::N_FRAMES))?)
    }

    /// Most likely language token after start-of-transcript.
    fn detect_language(
        &self,
        model: &mut m::model::Whisper,
        features: &Tensor,
    ) -> Result<Option<u32>> {
        if self.tokens.languages.is_empty() {
            return Ok(None);
        }

        let tokens_t = Tensor::new(&[self.tokens.sot], &self.device)?.unsqueeze(0)?;
        let ys = model.decoder.forward(&tokens_t, features, true)?;
        let logits = model.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;

        let candidates = Tensor::new(self.tokens.languages.as_slice(), &self.device)?;
        let scores: Vec<f32> = logits.index_select(&candidates, 0)?.to_vec1()?;
        let best = argmax(&scores).map(|i| self.tokens.languages[i]);

        if let Some(token) = best {
            tracing::debug!("Detected language {:?}", self.tokenizer.id_to_token(token));
        }
        Ok(best)
    }

    fn decode(
        &self,
        model: &mut m::model::Whisper,
        features: &Tensor,
        language_token: Option<u32>,
    ) -> Result<Decoded> {
        let mut tokens = vec![self.tokens.sot];
        tokens.extend(language_token);
        tokens.push(self.tokens.transcribe);
        tokens.push(self.tokens.no_timestamps);
        let prompt_len = tokens.len();

        let mut sum_logprob = 0.0f64;
        let mut sum_probability = 0.0f64;
        let mut no_speech_prob = 0.0f64;
        let limit = self.max_tokens.min(self.config.max_target_positions / 2);

        for i in 0..limit {
            let tokens_t = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = model.decoder.forward(&tokens_t, features, i == 0)?;

            if i == 0 {
                if let Some(no_speech) = self.tokens.no_speech {
                    let logits = model.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;
                    no_speech_prob = softmax(&logits, D::Minus1)?
                        .i(no_speech as usize)?
                        .to_scalar::<f32>()? as f64;
                }
            }

            let (_, seq_len, _) = ys.dims3()?;
            let logits = model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;
            let logits = logits.broadcast_add(&self.suppress)?;

            let values: Vec<f32> = logits.to_vec1()?;
            let next = argmax(&values).ok_or_else(|| anyhow!("Decoder produced empty logits"))? as u32;
            if next == self.tokens.eot {
                break;
            }

            let prob = softmax(&logits, D::Minus1)?
                .i(next as usize)?
                .to_scalar::<f32>()? as f64;
            sum_logprob += prob.max(f64::MIN_POSITIVE).ln();
            sum_probability += prob;
            tokens.push(next);
        }

        let generated = tokens.split_off(prompt_len);
        let count = generated.len().max(1) as f64;
        Ok(Decoded {
            avg_logprob: sum_logprob / count,
            mean_probability: if generated.is_empty() { 0.0 } else { sum_probability / count },
            tokens: generated,
            no_speech_prob,
        })
    }
}

impl TranscriptionEngine for WhisperEngine {
    fn transcribe(
        &self,
        samples: &[f32],
        language: Option<&str>,
    ) -> Result<TranscriptionOutput, EngineError> {
        self.run(samples, language).map_err(EngineError::from)
    }

    fn name(&self) -> String {
        format!("whisper-{}", self.size)
    }
}

fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(i, _)| i)
}

/// Additive logit mask: `-inf` for tokens that must never be generated.
fn suppress_mask(config: &Config, tokens: &SpecialTokens, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..config.vocab_size as u32)
        .map(|id| {
            if config.suppress_tokens.contains(&id)
                || id == tokens.no_timestamps
                || id == tokens.sot
                || tokens.no_speech == Some(id)
            {
                f32::NEG_INFINITY
            } else {
                0.0
            }
        })
        .collect();
    Ok(Tensor::new(mask.as_slice(), device)?)
}

fn hz_to_mel(hz: f32) -> f32 {
    const F_SP: f32 = 200.0 / 3.0;
    const MIN_LOG_HZ: f32 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let log_step = 6.4f32.ln() / 27.0;

    if hz >= MIN_LOG_HZ {
        min_log_mel + (hz / MIN_LOG_HZ).ln() / log_step
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f32) -> f32 {
    const F_SP: f32 = 200.0 / 3.0;
    const MIN_LOG_HZ: f32 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let log_step = 6.4f32.ln() / 27.0;

    if mel >= min_log_mel {
        MIN_LOG_HZ * (log_step * (mel - min_log_mel)).exp()
    } else {
        mel * F_SP
    }
}

/// Slaney-normalized triangular mel filterbank, row-major `n_mels x (n_fft / 2 + 1)`.
fn mel_filter_bank(n_mels: usize, n_fft: usize, sample_rate: f32) -> Vec<f32> {
    let n_freqs = n_fft / 2 + 1;
    let fft_freqs: Vec<f32> = (0..n_freqs)
        .map(|k| k as f32 * sample_rate / n_fft as f32)
        .collect();

    let min_mel = hz_to_mel(0.0);
    let max_mel = hz_to_mel(sample_rate / 2.0);
    let mel_points: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz(min_mel + (max_mel - min_mel) * i as f32 / (n_mels + 1) as f32))
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_freqs];
    for band in 0..n_mels {
        let (lower, center, upper) = (mel_points[band], mel_points[band + 1], mel_points[band + 2]);
        let norm = 2.0 / (upper - lower);
        for (k, &freq) in fft_freqs.iter().enumerate() {
            let rising = (freq - lower) / (center - lower);
            let falling = (upper - freq) / (upper - center);
            filters[band * n_freqs + k] = rising.min(falling).max(0.0) * norm;
        }
    }
    filters
}
