//! # Audio Decoding
//!
//! Turns opaque client payloads into normalized mono f32 samples at the service's
//! target sample rate. The session treats the decoder as a stateless collaborator:
//! one call per chunk, no memory between calls.
//!
//! ## Accepted Payloads:
//! - **RIFF/WAVE**: 8/16/24/32-bit integer or 32-bit float, any channel count and
//!   sample rate (read with `hound`)
//! - **Compressed containers**: Ogg, Matroska/WebM, FLAC, MP3 and MP4/M4A, decoded
//!   with `symphonia` when the codec is supported (Vorbis, FLAC, MP3, AAC). Opus
//!   is recognised but not decodable, so it is reported as unsupported.
//! - **Raw PCM**: headerless 16-bit little-endian mono at the target rate
//!
//! Every decoded payload is downmixed to mono and linearly resampled.
//!
//! Anything else (empty payloads, odd byte counts, truncated headers, unsupported
//! codecs) is a `DecodeError`.

use crate::error::DecodeError;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Decodes one audio payload into PCM samples.
pub trait AudioDecoder: Send + Sync {
    /// Decode `payload` into mono samples in [-1.0, 1.0] at `sample_rate()`.
    fn decode(&self, payload: &[u8]) -> Result<Vec<f32>, DecodeError>;

    /// Sample rate of every decoded chunk.
    fn sample_rate(&self) -> u32;
}

/// What a payload looks like, judged from its leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadKind {
    Wave,
    /// A container with an unambiguous signature; `&str` is the file extension hint
    Container(&'static str),
    /// Starts like an MPEG audio frame. Raw PCM can look the same, so a failed
    /// decode falls back to PCM.
    MpegFrame,
    Raw,
}

fn sniff(payload: &[u8]) -> PayloadKind {
    let starts = |magic: &[u8]| payload.starts_with(magic);

    if payload.len() >= 12 && starts(b"RIFF") && &payload[8..12] == b"WAVE" {
        PayloadKind::Wave
    } else if starts(b"OggS") {
        PayloadKind::Container("ogg")
    } else if starts(&[0x1A, 0x45, 0xDF, 0xA3]) {
        PayloadKind::Container("webm")
    } else if starts(b"fLaC") {
        PayloadKind::Container("flac")
    } else if starts(b"ID3") {
        PayloadKind::Container("mp3")
    } else if payload.len() >= 8 && &payload[4..8] == b"ftyp" {
        PayloadKind::Container("m4a")
    } else if is_mpeg_frame_header(payload) {
        PayloadKind::MpegFrame
    } else {
        PayloadKind::Raw
    }
}

/// Frame sync plus valid version, layer, bitrate and sample-rate fields.
fn is_mpeg_frame_header(payload: &[u8]) -> bool {
    if payload.len() < 4 || payload[0] != 0xFF || payload[1] & 0xE0 != 0xE0 {
        return false;
    }
    // FF FF is a common PCM pattern (sample -1)
    if payload[1] == 0xFF {
        return false;
    }

    let version = (payload[1] >> 3) & 0x03;
    let layer = (payload[1] >> 1) & 0x03;
    let bitrate = payload[2] >> 4;
    let sample_rate = (payload[2] >> 2) & 0x03;

    version != 0x01 && layer != 0x00 && bitrate != 0x00 && bitrate != 0x0F && sample_rate != 0x03
}

/// Decoder for WAV, common compressed containers and raw 16-bit PCM.
#[derive(Debug, Clone)]
pub struct PcmDecoder {
    sample_rate: u32,
}

impl PcmDecoder {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    fn decode_wav(&self, payload: &[u8]) -> Result<Vec<f32>, DecodeError> {
        let reader = hound::WavReader::new(Cursor::new(payload))
            .map_err(|e| DecodeError(format!("Invalid WAV payload: {}", e)))?;

        let spec = reader.spec();
        if spec.channels == 0 {
            return Err(DecodeError("WAV payload declares zero channels".to_string()));
        }
        if spec.sample_rate == 0 {
            return Err(DecodeError("WAV payload declares a zero sample rate".to_string()));
        }

        let interleaved = match spec.sample_format {
            hound::SampleFormat::Float => read_wav_samples(reader.into_samples::<f32>(), |s| s)?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
                read_wav_samples(reader.into_samples::<i32>(), |s| s as f32 / scale)?
            }
        };

        let mono = downmix(&interleaved, spec.channels as usize);
        Ok(resample_linear(&mono, spec.sample_rate, self.sample_rate))
    }

    fn decode_container(&self, payload: &[u8], extension: &str) -> Result<Vec<f32>, DecodeError> {
        let source = MediaSourceStream::new(Box::new(Cursor::new(payload.to_vec())), Default::default());
        let mut hint = Hint::new();
        hint.with_extension(extension);

        let detected = symphonia::default::get_probe()
            .format(&hint, source, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| DecodeError(format!("Unrecognized {} payload: {}", extension, e)))?;
        let mut format = detected.format;

        let params = format
            .tracks()
            .iter()
            .find(|track| track.codec_params.codec != CODEC_TYPE_NULL)
            .map(|track| (track.id, track.codec_params.clone()))
            .ok_or_else(|| DecodeError(format!("{} payload has no audio track", extension)))?;
        let (track_id, codec_params) = params;

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| DecodeError(format!("Unsupported codec in {} payload: {}", extension, e)))?;

        let mut sample_rate = codec_params.sample_rate.unwrap_or(0);
        let mut channels = codec_params.channels.map(|c| c.count()).unwrap_or(1);
        let mut interleaved = Vec::new();

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    break;
                }
                Err(SymphoniaError::ResetRequired) => break,
                Err(e) => {
                    return Err(DecodeError(format!("Corrupt {} payload: {}", extension, e)));
                }
            };
            if packet.track_id() != track_id {
                continue;
            }

            match decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    sample_rate = spec.rate;
                    channels = spec.channels.count();

                    let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                    buffer.copy_interleaved_ref(decoded);
                    interleaved.extend_from_slice(buffer.samples());
                }
                // A damaged packet is skipped; the rest of the chunk is still usable
                Err(SymphoniaError::DecodeError(e)) => {
                    tracing::debug!("Skipping undecodable {} packet: {}", extension, e);
                }
                Err(e) => {
                    return Err(DecodeError(format!("Failed to decode {} payload: {}", extension, e)));
                }
            }
        }

        if interleaved.is_empty() {
            return Err(DecodeError(format!("{} payload contains no audio data", extension)));
        }
        if sample_rate == 0 || channels == 0 {
            return Err(DecodeError(format!("{} payload has no usable stream format", extension)));
        }

        let mono = downmix(&interleaved, channels);
        Ok(resample_linear(&mono, sample_rate, self.sample_rate))
    }

    fn decode_raw(&self, payload: &[u8]) -> Result<Vec<f32>, DecodeError> {
        if payload.len() % 2 != 0 {
            return Err(DecodeError(
                "Raw PCM length must be even for 16-bit samples".to_string(),
            ));
        }

        let mut cursor = Cursor::new(payload);
        let mut samples = Vec::with_capacity(payload.len() / 2);
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            samples.push(sample);
        }

        Ok(pcm16_to_float(&samples))
    }
}

impl AudioDecoder for PcmDecoder {
    fn decode(&self, payload: &[u8]) -> Result<Vec<f32>, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError("No audio data provided".to_string()));
        }

        let samples = match sniff(payload) {
            PayloadKind::Wave => self.decode_wav(payload)?,
            PayloadKind::Container(extension) => self.decode_container(payload, extension)?,
            PayloadKind::MpegFrame => match self.decode_container(payload, "mp3") {
                Ok(samples) => samples,
                Err(e) => {
                    tracing::trace!("Not an MPEG frame ({}), reading as raw PCM", e);
                    self.decode_raw(payload)?
                }
            },
            PayloadKind::Raw => self.decode_raw(payload)?,
        };

        // Non-finite values would poison every window they end up in
        if samples.iter().any(|s| !s.is_finite()) {
            return Err(DecodeError("Audio contains non-finite samples".to_string()));
        }

        Ok(samples)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Collect WAV samples, keeping what was read before a truncated data chunk.
///
/// Streaming writers often leave placeholder chunk sizes, so running out of data
/// early is only an error when nothing at all could be read.
fn read_wav_samples<S, I>(samples: I, convert: impl Fn(S) -> f32) -> Result<Vec<f32>, DecodeError>
where
    I: Iterator<Item = hound::Result<S>>,
{
    let mut out = Vec::new();
    for sample in samples {
        match sample {
            Ok(sample) => out.push(convert(sample)),
            Err(e) if out.is_empty() => {
                return Err(DecodeError(format!("Invalid WAV payload: {}", e)));
            }
            Err(e) => {
                tracing::debug!("WAV data ended early after {} samples: {}", out.len(), e);
                break;
            }
        }
    }

    if out.is_empty() {
        return Err(DecodeError("WAV payload contains no audio data".to_string()));
    }
    Ok(out)
}

/// Scale 16-bit PCM to [-1.0, 1.0).
pub fn pcm16_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Average interleaved frames down to one channel. A trailing partial frame is dropped.
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }

    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Linear-interpolation resampler; adequate for speech at ASR rates.
fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.len() < 2 {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).floor().max(1.0) as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let position = i as f64 * ratio;
            let index = (position.floor() as usize).min(last);
            let next = (index + 1).min(last);
            let frac = (position - index as f64) as f32;
            samples[index] + (samples[next] - samples[index]) * frac
        })
        .collect()
}
