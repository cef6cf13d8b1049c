//! # Audio Streaming Module
//!
//! Everything between a client's raw audio frames and a transcription job.
//!
//! ## Key Components:
//! - **Decoder**: WAV or raw PCM payloads to normalized mono samples
//! - **Rolling Buffer**: bounded per-session ring of chunks producing overlapping windows
//! - **Session**: per-connection state machine (language, buffer, dispatch, results)
//! - **Registry**: process-wide set of live sessions
//!
//! ## Audio Format:
//! - **Sample Rate**: 16kHz by default (`audio.sample_rate`)
//! - **Channels**: Mono after downmixing
//! - **Samples**: f32 in [-1.0, 1.0]

pub mod buffer;
pub mod decoder;
pub mod language;
pub mod registry;
pub mod session;
