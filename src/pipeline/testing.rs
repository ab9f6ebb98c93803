//! In-process provider fakes shared by the pipeline tests.

use crate::config::AppConfig;
use crate::conversation::{ConversationStore, Turn};
use crate::error::{ProviderError, ProviderResult};
use crate::pipeline::{PipelineSettings, VoicePipeline};
use crate::providers::{
    FragmentStream, PcmFormat, ReplyGenerator, SynthesisConnector, SynthesisEvents,
    SynthesisSession, Transcriber, TranscriptionRequest,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct FakeTranscriber {
    result: ProviderResult<String>,
    calls: Arc<AtomicUsize>,
}

impl FakeTranscriber {
    pub fn returning(text: &str) -> Self {
        Self {
            result: Ok(text.to_string()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(err: ProviderError) -> Self {
        Self {
            result: Err(err),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, _request: TranscriptionRequest<'_>) -> ProviderResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}

#[derive(Clone)]
pub struct FakeReplies {
    fragments: Vec<String>,
    stream_available: bool,
    stream_fails: bool,
    full: String,
}

impl FakeReplies {
    pub fn streaming(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            stream_available: true,
            stream_fails: false,
            full: fragments.concat(),
        }
    }

    /// Streams `fragments`, then yields an error; the blocking call answers `full`.
    pub fn failing_after(fragments: &[&str], full: &str) -> Self {
        Self {
            stream_fails: true,
            full: full.to_string(),
            ..Self::streaming(fragments)
        }
    }

    pub fn stream_unavailable(full: &str) -> Self {
        Self {
            fragments: Vec::new(),
            stream_available: false,
            stream_fails: false,
            full: full.to_string(),
        }
    }
}

#[async_trait]
impl ReplyGenerator for FakeReplies {
    async fn complete(&self, _turns: &[Turn]) -> ProviderResult<String> {
        Ok(self.full.clone())
    }

    async fn stream(&self, _turns: &[Turn]) -> ProviderResult<FragmentStream> {
        if !self.stream_available {
            return Err(ProviderError::Status {
                status: 500,
                body: "stream disabled".to_string(),
            });
        }
        let mut items: Vec<ProviderResult<String>> =
            self.fragments.iter().cloned().map(Ok).collect();
        if self.stream_fails {
            items.push(Err(ProviderError::Http("connection reset".to_string())));
        }
        Ok(futures_util::stream::iter(items).boxed())
    }
}

#[derive(Clone, Debug)]
enum Ending {
    Finish,
    Error(String),
    Silent,
}

/// Synthesis connector whose sessions emit a fixed list of chunks once
/// `finish` is called.
#[derive(Clone)]
pub struct FakeConnector {
    chunks: Vec<Vec<u8>>,
    delay: Option<Duration>,
    ending: Ending,
    fail_connect: bool,
    texts: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl FakeConnector {
    pub fn with_chunks(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks,
            delay: None,
            ending: Ending::Finish,
            fail_connect: false,
            texts: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_connect: true,
            ..Self::with_chunks(Vec::new())
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn erroring(mut self, message: &str) -> Self {
        self.ending = Ending::Error(message.to_string());
        self
    }

    /// Sessions never report completion.
    pub fn silent(mut self) -> Self {
        self.ending = Ending::Silent;
        self
    }

    /// Text appended across all sessions, in order.
    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SynthesisConnector for FakeConnector {
    fn supported_rates(&self) -> Vec<u32> {
        vec![24000]
    }

    async fn connect(
        &self,
        _model: &str,
        events: Arc<dyn SynthesisEvents>,
    ) -> ProviderResult<Box<dyn SynthesisSession>> {
        if self.fail_connect {
            return Err(ProviderError::Transport("connection refused".to_string()));
        }
        Ok(Box::new(FakeSession {
            events,
            config: self.clone(),
            emitter: None,
        }))
    }
}

struct FakeSession {
    events: Arc<dyn SynthesisEvents>,
    config: FakeConnector,
    emitter: Option<JoinHandle<()>>,
}

#[async_trait]
impl SynthesisSession for FakeSession {
    async fn configure(
        &mut self,
        _voice: &str,
        format: PcmFormat,
        _commit_mode: &str,
    ) -> ProviderResult<()> {
        assert_eq!(format.sample_rate, 24000);
        Ok(())
    }

    async fn append_text(&mut self, text: &str) -> ProviderResult<()> {
        self.config.texts.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn finish(&mut self) -> ProviderResult<()> {
        let events = self.events.clone();
        let chunks = self.config.chunks.clone();
        let delay = self.config.delay;
        let ending = self.config.ending.clone();

        self.emitter = Some(tokio::spawn(async move {
            events.on_audio_delta(None).await;
            for chunk in chunks {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                events.on_audio_delta(Some(chunk)).await;
            }
            match ending {
                Ending::Finish => events.on_session_finished().await,
                Ending::Error(message) => events.on_error(message).await,
                Ending::Silent => {}
            }
        }));
        Ok(())
    }

    async fn close(&mut self) {
        self.config.closed.store(true, Ordering::SeqCst);
        if let Some(emitter) = self.emitter.take() {
            emitter.abort();
        }
    }
}

/// Pipeline over fakes with default settings.
pub fn fake_pipeline(
    transcriber: FakeTranscriber,
    replies: FakeReplies,
    connector: FakeConnector,
) -> VoicePipeline {
    VoicePipeline::new(
        Arc::new(transcriber),
        Arc::new(replies),
        Arc::new(connector),
        ConversationStore::new("sys", 12),
        PipelineSettings::from_config(&AppConfig::default()),
    )
}
