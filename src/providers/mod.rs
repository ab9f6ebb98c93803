//! # Provider Interfaces
//!
//! The voice pipeline talks to three remote collaborators. Each one sits
//! behind a trait so the pipeline can be driven by in-process fakes in tests
//! and by the network clients in production:
//!
//! - [`Transcriber`]: speech recognition (`audio -> text`)
//! - [`ReplyGenerator`]: chat completions, blocking or as a fragment stream
//! - [`SynthesisConnector`] / [`SynthesisSession`]: a realtime synthesis session
//!   that receives text incrementally and reports audio through
//!   [`SynthesisEvents`]
//!
//! ## Implementations:
//! - **compat**: OpenAI-compatible REST client for recognition and chat
//! - **realtime**: WebSocket client for realtime synthesis

pub mod compat;
pub mod realtime;

use crate::conversation::Turn;
use crate::error::ProviderResult;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;

/// Audio handed to speech recognition.
#[derive(Debug, Clone, Copy)]
pub struct TranscriptionRequest<'a> {
    /// WAV file image
    pub audio: &'a [u8],
    /// Sample rate of the PCM inside `audio`
    pub sample_rate: u32,
    /// Language hint (ISO 639-1)
    pub language: &'a str,
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Returns trimmed, non-empty text or an error.
    async fn transcribe(&self, request: TranscriptionRequest<'_>) -> ProviderResult<String>;
}

/// Finite, non-restartable stream of reply text fragments.
pub type FragmentStream = BoxStream<'static, ProviderResult<String>>;

#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// Whole reply in one call.
    async fn complete(&self, turns: &[Turn]) -> ProviderResult<String>;

    /// Reply as it is generated.
    async fn stream(&self, turns: &[Turn]) -> ProviderResult<FragmentStream>;
}

/// PCM output format requested from a synthesis session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
}

/// Receiver of synthesis session events.
///
/// Exactly one implementation exists per session; the synthesis bridge owns it.
#[async_trait]
pub trait SynthesisEvents: Send + Sync {
    /// An audio delta. `None` when the event carried no payload.
    async fn on_audio_delta(&self, pcm: Option<Vec<u8>>);

    /// The session finished producing audio.
    async fn on_session_finished(&self);

    /// The session reported an error; no further events follow.
    async fn on_error(&self, message: String);
}

/// Opens realtime synthesis sessions.
#[async_trait]
pub trait SynthesisConnector: Send + Sync {
    /// PCM sample rates the provider can emit.
    fn supported_rates(&self) -> Vec<u32>;

    /// Connect a new session for `model`, delivering events to `events`.
    async fn connect(
        &self,
        model: &str,
        events: Arc<dyn SynthesisEvents>,
    ) -> ProviderResult<Box<dyn SynthesisSession>>;
}

/// A connected realtime synthesis session. Calls are strictly sequential.
#[async_trait]
pub trait SynthesisSession: Send {
    async fn configure(&mut self, voice: &str, format: PcmFormat, commit_mode: &str)
        -> ProviderResult<()>;

    async fn append_text(&mut self, text: &str) -> ProviderResult<()>;

    /// Signal that no more text follows.
    async fn finish(&mut self) -> ProviderResult<()>;

    /// Release the session. Never fails; errors are logged by the implementation.
    async fn close(&mut self);
}

/// Pick the provider rate to request for a desired output rate.
///
/// An exact match wins; otherwise the smallest supported rate above the
/// request (so downsampling never loses bandwidth), otherwise the highest
/// supported rate.
pub fn negotiate_rate(requested: u32, supported: &[u32]) -> u32 {
    if supported.contains(&requested) {
        return requested;
    }

    supported
        .iter()
        .copied()
        .filter(|rate| *rate > requested)
        .min()
        .or_else(|| supported.iter().copied().max())
        .unwrap_or(requested)
}
