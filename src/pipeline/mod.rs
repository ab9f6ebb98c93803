//! # Streaming Voice Pipeline
//!
//! Everything between "the user stopped talking" and "the last audio frame
//! went out":
//!
//! ```text
//! capture -> WAV -> transcription -> memory(user) -> reply stream
//!         -> flush policy -> synthesis bridge -> resampler -> client
//! ```
//!
//! ## Key Components:
//! - **flush**: when partial reply text is handed to synthesis
//! - **bridge**: one synthesis session on a worker task, exposed as a PCM stream
//! - **connection**: per-WebSocket protocol state machine
//!
//! [`VoicePipeline`] bundles the collaborators and settings shared by every
//! connection and by the HTTP streaming endpoint.

pub mod bridge;
pub mod connection;
pub mod flush;

#[cfg(test)]
pub mod testing;

use crate::audio::encode::pcm_to_wav;
use crate::config::AppConfig;
use crate::conversation::{ConversationStore, Turn};
use crate::error::{ProviderError, ProviderResult};
use crate::providers::compat::CompatClient;
use crate::providers::realtime::RealtimeConnector;
use crate::providers::{ReplyGenerator, SynthesisConnector, Transcriber, TranscriptionRequest};
use bridge::{spawn_bridge, BridgeRequest, BridgeSettings, ReplyInput, SynthesisInput, SynthesisStream};
use flush::FlushPolicy;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Settings resolved once from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub language: String,
    pub voice: String,
    pub tts_model: String,
    pub commit_mode: String,
    pub default_input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub min_capture_ms: u32,
    pub max_capture_seconds: u32,
    pub flush: FlushPolicy,
    pub fallback_reply: String,
    pub bridge: BridgeSettings,
    pub poll_interval: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            language: config.speech.language.clone(),
            voice: config.speech.voice.clone(),
            tts_model: config.models.tts_realtime_model.clone(),
            commit_mode: config.speech.commit_mode.clone(),
            default_input_sample_rate: config.audio.default_input_sample_rate,
            output_sample_rate: config.audio.output_sample_rate,
            min_capture_ms: config.audio.min_capture_ms,
            max_capture_seconds: config.audio.max_capture_seconds,
            flush: FlushPolicy::from_config(&config.flush),
            fallback_reply: config.conversation.fallback_reply.clone(),
            bridge: BridgeSettings {
                channel_capacity: config.performance.channel_capacity,
                session_timeout: config.session_timeout(),
            },
            poll_interval: config.poll_interval(),
        }
    }
}

/// Reply cycle counters.
#[derive(Debug, Default)]
pub struct CycleStats {
    started: AtomicU64,
    completed: AtomicU64,
    aborted: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleSnapshot {
    pub started: u64,
    pub completed: u64,
    pub aborted: u64,
    pub failed: u64,
}

/// How a reply cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed,
    Aborted,
    Failed,
}

impl CycleStats {
    pub fn record_start(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record(&self, outcome: CycleOutcome) {
        let counter = match outcome {
            CycleOutcome::Completed => &self.completed,
            CycleOutcome::Aborted => &self.aborted,
            CycleOutcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CycleSnapshot {
        CycleSnapshot {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Shared collaborators of every voice session.
pub struct VoicePipeline {
    pub transcriber: Arc<dyn Transcriber>,
    pub replies: Arc<dyn ReplyGenerator>,
    pub synthesis: Arc<dyn SynthesisConnector>,
    pub memory: ConversationStore,
    pub settings: PipelineSettings,
    pub stats: CycleStats,
}

impl VoicePipeline {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        replies: Arc<dyn ReplyGenerator>,
        synthesis: Arc<dyn SynthesisConnector>,
        memory: ConversationStore,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            transcriber,
            replies,
            synthesis,
            memory,
            settings,
            stats: CycleStats::default(),
        }
    }

    /// Wire the network clients described by `config`.
    pub fn from_config(config: &AppConfig) -> ProviderResult<Self> {
        let compat = Arc::new(CompatClient::new(config)?);
        let memory = ConversationStore::new(
            config.conversation.system_prompt.clone(),
            config.conversation.max_turns,
        );

        Ok(Self::new(
            compat.clone(),
            compat,
            Arc::new(RealtimeConnector::new(config)),
            memory,
            PipelineSettings::from_config(config),
        ))
    }

    /// Transcribe a WAV file image.
    pub async fn transcribe_wav(&self, wav: &[u8], sample_rate: u32) -> ProviderResult<String> {
        self.transcriber
            .transcribe(TranscriptionRequest {
                audio: wav,
                sample_rate,
                language: &self.settings.language,
            })
            .await
    }

    /// Transcribe raw 16-bit mono PCM captured at `sample_rate`.
    pub async fn transcribe_pcm(&self, pcm: &[u8], sample_rate: u32) -> ProviderResult<String> {
        let wav = pcm_to_wav(pcm, sample_rate)
            .map_err(|e| ProviderError::BadResponse(format!("wav encoding failed: {}", e)))?;
        self.transcribe_wav(&wav, sample_rate).await
    }

    /// Generate, speak and remember a reply to `turns` for `device_id`.
    pub fn start_reply(&self, device_id: &str, turns: Vec<Turn>) -> SynthesisStream {
        let request = BridgeRequest {
            model: self.settings.tts_model.clone(),
            voice: self.settings.voice.clone(),
            commit_mode: self.settings.commit_mode.clone(),
            requested_rate: self.settings.output_sample_rate,
            input: SynthesisInput::Reply(ReplyInput {
                turns,
                generator: self.replies.clone(),
                policy: self.settings.flush.clone(),
                store: self.memory.clone(),
                device_id: device_id.to_string(),
                fallback_reply: self.settings.fallback_reply.clone(),
            }),
        };
        spawn_bridge(self.synthesis.clone(), request, self.settings.bridge)
    }

    /// Speak fixed text.
    pub fn start_speech(&self, text: &str) -> SynthesisStream {
        let request = BridgeRequest {
            model: self.settings.tts_model.clone(),
            voice: self.settings.voice.clone(),
            commit_mode: self.settings.commit_mode.clone(),
            requested_rate: self.settings.output_sample_rate,
            input: SynthesisInput::Text(text.to_string()),
        };
        spawn_bridge(self.synthesis.clone(), request, self.settings.bridge)
    }
}
