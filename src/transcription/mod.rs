//! # Transcription Module
//!
//! Turns ready audio windows into text, off the connection's execution context.
//!
//! ## Key Components:
//! - **Engine**: the `TranscriptionEngine` trait every backend implements
//! - **Pool**: bounded job queue and fixed set of workers calling the engine
//! - **Whisper**: Candle-based Whisper backend loaded from HuggingFace
//!
//! ## Whisper Model Sizes:
//! - **tiny**: ~39MB, fastest but least accurate
//! - **base**: ~74MB, good balance for development
//! - **small**: ~244MB, default; reasonable for streaming on CPU
//! - **medium**: ~769MB, better accuracy
//! - **large**: ~1550MB, best accuracy but slowest

pub mod engine;
pub mod pool;
pub mod whisper;
