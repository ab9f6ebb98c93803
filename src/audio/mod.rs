//! # Audio Processing Module
//!
//! PCM handling shared by the WebSocket and HTTP voice paths.
//!
//! ## Audio Format:
//! - **Bit Depth**: 16-bit PCM, little-endian signed integers
//! - **Channels**: Mono (1 channel)
//! - **Sample Rate**: declared per connection (capture) and per deployment (playback)
//!
//! ## Key Components:
//! - **capture**: per-utterance byte accumulator for the listening phase
//! - **resample**: phase-continuous linear sample-rate conversion
//! - **encode**: WAV packaging for speech recognition uploads

pub mod capture;
pub mod encode;
pub mod resample;
