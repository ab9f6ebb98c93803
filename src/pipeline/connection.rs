//! # Connection State Machine
//!
//! Protocol handler for one voice WebSocket connection, independent of the
//! transport. The WebSocket actor feeds it text and binary frames in arrival
//! order and drains [`Outgoing`] messages from a single queue, so transcript
//! and synthesis notifications stay ordered relative to audio.
//!
//! ## Phases:
//! ```text
//! idle --listen start--> listening --listen stop--> speaking --done/abort--> idle
//!                          ^    |
//!                          +----+ listen start restarts the capture
//! ```
//!
//! ## Client Messages (JSON, `type` tagged):
//! - `hello`: declares the capture sample rate; answered with a server hello
//! - `listen` with `state` `start` / `stop`
//! - `abort`: stop the current reply
//!
//! ## Server Messages:
//! - `hello`: session id and output audio parameters
//! - `stt`: the recognised text
//! - `tts` with `state` `start` / `stop`, bracketing binary PCM frames
//!
//! The reply cycle runs on its own task so `abort` is processed while speaking.

use crate::audio::capture::{is_usable_capture, CaptureBuffer};
use crate::audio::resample::StreamResampler;
use crate::conversation::{ConversationStore, Role, Turn};
use crate::pipeline::{CycleOutcome, VoicePipeline};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Listening,
    Speaking,
}

/// Frame queued for the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    Audio(Bytes),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Hello {
        #[serde(default)]
        audio_params: Option<ClientAudioParams>,
    },
    Listen {
        #[serde(default)]
        state: String,
        #[serde(default)]
        mode: Option<String>,
    },
    Abort,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClientAudioParams {
    #[serde(default)]
    pub sample_rate: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ServerAudioParams {
    pub format: &'static str,
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage<'a> {
    Hello {
        transport: &'static str,
        session_id: &'a str,
        audio_params: ServerAudioParams,
    },
    Stt {
        session_id: &'a str,
        text: &'a str,
    },
    Tts {
        session_id: &'a str,
        state: &'static str,
    },
}

impl ServerMessage<'_> {
    fn to_outgoing(&self) -> Option<Outgoing> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Outgoing::Text(json)),
            Err(e) => {
                warn!(error = %e, "Failed to encode server message");
                None
            }
        }
    }
}

/// Phase plus the number of the reply cycle that last entered `Speaking`.
#[derive(Debug, Clone, Copy)]
struct PhaseState {
    phase: Phase,
    cycle: u64,
}

type SharedPhase = Arc<Mutex<PhaseState>>;

fn lock_phase(phase: &SharedPhase) -> MutexGuard<'_, PhaseState> {
    phase.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_phase(phase: &SharedPhase) -> Phase {
    lock_phase(phase).phase
}

fn write_phase(phase: &SharedPhase, next: Phase) {
    lock_phase(phase).phase = next;
}

/// Enter `Speaking` for a new cycle and return its number.
fn begin_cycle(phase: &SharedPhase) -> u64 {
    let mut state = lock_phase(phase);
    state.phase = Phase::Speaking;
    state.cycle += 1;
    state.cycle
}

/// Return to `Idle` unless the connection already moved past `cycle`.
fn end_cycle(phase: &SharedPhase, cycle: u64) {
    let mut state = lock_phase(phase);
    if state.cycle == cycle && state.phase == Phase::Speaking {
        state.phase = Phase::Idle;
    }
}

/// State of one live connection.
pub struct ConnectionSession {
    session_id: String,
    device_id: String,
    input_sample_rate: u32,
    phase: SharedPhase,
    abort: Arc<AtomicBool>,
    capture: CaptureBuffer,
    outbound: mpsc::Sender<Outgoing>,
    pipeline: Arc<VoicePipeline>,
    reply_task: Option<JoinHandle<()>>,
}

impl ConnectionSession {
    pub fn new(device_id: &str, pipeline: Arc<VoicePipeline>, outbound: mpsc::Sender<Outgoing>) -> Self {
        let input_sample_rate = pipeline.settings.default_input_sample_rate;
        let capture = CaptureBuffer::new(CaptureBuffer::bound_for(
            input_sample_rate,
            pipeline.settings.max_capture_seconds,
        ));

        Self {
            session_id: new_session_id(),
            device_id: ConversationStore::device_key(device_id),
            input_sample_rate,
            phase: Arc::new(Mutex::new(PhaseState {
                phase: Phase::Idle,
                cycle: 0,
            })),
            abort: Arc::new(AtomicBool::new(false)),
            capture,
            outbound,
            pipeline,
            reply_task: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn phase(&self) -> Phase {
        read_phase(&self.phase)
    }

    pub fn input_sample_rate(&self) -> u32 {
        self.input_sample_rate
    }

    /// Handle one JSON control frame. Malformed frames are dropped.
    pub fn handle_text(&mut self, text: &str) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(session_id = %self.session_id, error = %e, "Dropping control message");
                return;
            }
        };

        match message {
            ClientMessage::Hello { audio_params } => self.handle_hello(audio_params),
            ClientMessage::Listen { state, mode } => match state.as_str() {
                "start" => self.listen_start(mode.as_deref().unwrap_or("auto")),
                "stop" => self.listen_stop(),
                other => debug!(session_id = %self.session_id, state = other, "Ignoring listen state"),
            },
            ClientMessage::Abort => self.handle_abort(),
        }
    }

    /// Handle one binary frame; kept only while listening.
    pub fn handle_binary(&mut self, frame: &[u8]) {
        if self.phase() == Phase::Listening {
            self.capture.write(frame);
        }
    }

    fn handle_hello(&mut self, params: Option<ClientAudioParams>) {
        if let Some(rate) = params.and_then(|p| p.sample_rate).filter(|r| *r > 0) {
            self.input_sample_rate = rate;
        }
        if !self.capture.is_open() {
            self.capture = CaptureBuffer::new(CaptureBuffer::bound_for(
                self.input_sample_rate,
                self.pipeline.settings.max_capture_seconds,
            ));
        }

        let hello = ServerMessage::Hello {
            transport: "websocket",
            session_id: &self.session_id,
            audio_params: ServerAudioParams {
                format: "pcm",
                sample_rate: self.pipeline.settings.output_sample_rate,
                channels: 1,
            },
        };
        if let Some(frame) = hello.to_outgoing() {
            if self.outbound.try_send(frame).is_err() {
                warn!(session_id = %self.session_id, "Outbound queue full, hello dropped");
            }
        }
        info!(
            session_id = %self.session_id,
            sample_rate = self.input_sample_rate,
            "Hello handshake complete"
        );
    }

    fn listen_start(&mut self, mode: &str) {
        match self.phase() {
            Phase::Speaking => {
                debug!(session_id = %self.session_id, "Listen start ignored while speaking");
            }
            Phase::Idle | Phase::Listening => {
                self.capture.start();
                write_phase(&self.phase, Phase::Listening);
                debug!(session_id = %self.session_id, mode, "Listening");
            }
        }
    }

    fn listen_stop(&mut self) {
        if self.phase() != Phase::Listening {
            return;
        }

        let pcm = self.capture.stop();
        let settings = &self.pipeline.settings;
        if !is_usable_capture(&pcm, self.input_sample_rate, settings.min_capture_ms) {
            debug!(session_id = %self.session_id, bytes = pcm.len(), "Capture too short, skipping");
            write_phase(&self.phase, Phase::Idle);
            return;
        }

        let cycle = begin_cycle(&self.phase);
        // Each cycle gets its own flag so a late abort cannot leak into the next one.
        self.abort = Arc::new(AtomicBool::new(false));

        let cycle = ReplyCycle {
            cycle,
            session_id: self.session_id.clone(),
            device_id: self.device_id.clone(),
            sample_rate: self.input_sample_rate,
            pcm,
            pipeline: self.pipeline.clone(),
            outbound: self.outbound.clone(),
            phase: self.phase.clone(),
            abort: self.abort.clone(),
        };
        self.reply_task = Some(tokio::spawn(cycle.run()));
    }

    /// Stop the current reply. The connection is idle again as soon as this
    /// returns; the cycle task winds down on its own.
    fn handle_abort(&mut self) {
        self.abort.store(true, Ordering::SeqCst);
        let phase = {
            let mut state = lock_phase(&self.phase);
            let before = state.phase;
            if before == Phase::Speaking {
                state.phase = Phase::Idle;
            }
            before
        };
        info!(session_id = %self.session_id, phase = ?phase, "Abort requested");
    }

    /// Release everything held by the connection without waiting.
    pub fn teardown(&mut self) {
        self.abort.store(true, Ordering::SeqCst);
        self.capture.release();
        // The cycle observes the abort flag and drops its bridge handle.
        self.reply_task.take();
    }

    #[cfg(test)]
    async fn join_reply(&mut self) {
        if let Some(task) = self.reply_task.take() {
            task.await.unwrap();
        }
    }
}

/// First 8 hex chars of a v4 UUID.
fn new_session_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// One stop-to-idle run: transcription, reply and audio streaming.
struct ReplyCycle {
    cycle: u64,
    session_id: String,
    device_id: String,
    sample_rate: u32,
    pcm: Vec<u8>,
    pipeline: Arc<VoicePipeline>,
    outbound: mpsc::Sender<Outgoing>,
    phase: SharedPhase,
    abort: Arc<AtomicBool>,
}

impl ReplyCycle {
    async fn run(self) {
        let stats = &self.pipeline.stats;
        stats.record_start();

        let outcome = self.converse().await;
        stats.record(outcome);
        end_cycle(&self.phase, self.cycle);

        info!(
            session_id = %self.session_id,
            device_id = %self.device_id,
            cycle = self.cycle,
            outcome = ?outcome,
            "Reply cycle finished"
        );
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    async fn send(&self, message: ServerMessage<'_>) -> bool {
        match message.to_outgoing() {
            Some(frame) => self.outbound.send(frame).await.is_ok(),
            None => false,
        }
    }

    async fn converse(&self) -> CycleOutcome {
        let text = match self.pipeline.transcribe_pcm(&self.pcm, self.sample_rate).await {
            Ok(text) => text,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "Transcription failed");
                return CycleOutcome::Failed;
            }
        };
        if self.aborted() {
            return CycleOutcome::Aborted;
        }

        info!(session_id = %self.session_id, text = %text, "Transcribed");
        self.send(ServerMessage::Stt {
            session_id: &self.session_id,
            text: &text,
        })
        .await;

        let turns = self
            .pipeline
            .memory
            .append(&self.device_id, Turn::new(Role::User, text))
            .await;

        self.send(ServerMessage::Tts {
            session_id: &self.session_id,
            state: "start",
        })
        .await;

        let outcome = self.stream_reply(turns).await;

        self.send(ServerMessage::Tts {
            session_id: &self.session_id,
            state: "stop",
        })
        .await;
        outcome
    }

    async fn stream_reply(&self, turns: Vec<Turn>) -> CycleOutcome {
        let poll_interval = self.pipeline.settings.poll_interval;
        let mut stream = self.pipeline.start_reply(&self.device_id, turns);
        let mut resampler =
            StreamResampler::new(stream.sample_rate(), self.pipeline.settings.output_sample_rate);
        let mut frames = 0usize;

        let aborted = loop {
            if self.aborted() {
                break true;
            }

            let chunk = match tokio::time::timeout(poll_interval, stream.recv()).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break false,
                Err(_) if stream.is_cancelled() => break false,
                Err(_) => continue,
            };

            if self.aborted() {
                break true;
            }

            let pcm = resampler.process(&chunk);
            if pcm.is_empty() {
                continue;
            }
            if self.outbound.send(Outgoing::Audio(Bytes::from(pcm))).await.is_err() {
                debug!(session_id = %self.session_id, "Client gone while streaming");
                break true;
            }
            frames += 1;
        };

        stream.cancel();
        debug!(session_id = %self.session_id, frames, aborted, "Reply streaming stopped");

        if aborted {
            return CycleOutcome::Aborted;
        }
        match stream.error() {
            Some(e) => {
                warn!(session_id = %self.session_id, error = %e, "Synthesis failed");
                CycleOutcome::Failed
            }
            None => CycleOutcome::Completed,
        }
    }
}
