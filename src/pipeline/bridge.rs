//! # Synthesis Bridge
//!
//! Turns text (fixed, or a live reply stream) into a stream of PCM chunks by
//! driving one realtime synthesis session on its own worker task.
//!
//! ## Lifecycle:
//! ```text
//! connect -> configure(voice, pcm@rate, commit mode) -> append_text* -> finish
//!         -> wait for session.finished | error | cancel | timeout -> close
//! ```
//!
//! ## Guarantees:
//! - The consumer always sees [`BridgeItem::End`] last (sent with a 1s bound).
//! - The session is closed whichever step failed.
//! - The error slot is written at most once; the first failure wins.
//! - Cancelling stops emission; deltas arriving afterwards are dropped.
//! - A panicking worker still cancels, records an error and tries to send `End`.
//!
//! The worker communicates with its consumer only through the bounded queue,
//! the cancellation token and the error slot.

use crate::conversation::{ConversationStore, Role, Turn};
use crate::error::{ProviderError, ProviderResult};
use crate::pipeline::flush::{FlushBuffer, FlushPolicy};
use crate::providers::{
    negotiate_rate, PcmFormat, ReplyGenerator, SynthesisConnector, SynthesisEvents,
    SynthesisSession,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const END_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Item delivered to the bridge consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeItem {
    Chunk(Vec<u8>),
    End,
}

/// What the bridge should speak.
pub enum SynthesisInput {
    /// Precomputed text, appended in one piece.
    Text(String),
    /// Live reply generated from a conversation.
    Reply(ReplyInput),
}

/// Everything needed to generate, speak and remember one reply.
pub struct ReplyInput {
    pub turns: Vec<Turn>,
    pub generator: Arc<dyn ReplyGenerator>,
    pub policy: FlushPolicy,
    pub store: ConversationStore,
    pub device_id: String,
    pub fallback_reply: String,
}

pub struct BridgeRequest {
    pub model: String,
    pub voice: String,
    pub commit_mode: String,
    /// Desired output rate; the session runs at the negotiated rate.
    pub requested_rate: u32,
    pub input: SynthesisInput,
}

#[derive(Debug, Clone, Copy)]
pub struct BridgeSettings {
    pub channel_capacity: usize,
    pub session_timeout: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            session_timeout: Duration::from_secs(120),
        }
    }
}

/// Consumer handle of a running bridge. Dropping it cancels the worker.
#[derive(Debug)]
pub struct SynthesisStream {
    rx: mpsc::Receiver<BridgeItem>,
    cancel: CancellationToken,
    error: Arc<OnceLock<ProviderError>>,
    sample_rate: u32,
    ended: bool,
}

impl SynthesisStream {
    /// Next PCM chunk, or `None` once the end marker has been consumed.
    ///
    /// Cancel-safe, so it can be raced against a poll timer.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        if self.ended {
            return None;
        }
        match self.rx.recv().await {
            Some(BridgeItem::Chunk(pcm)) => Some(pcm),
            Some(BridgeItem::End) | None => {
                self.ended = true;
                None
            }
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True once the end marker was consumed.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn error(&self) -> Option<ProviderError> {
        self.error.get().cloned()
    }

    /// Rate of the PCM this stream yields.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for SynthesisStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start a bridge worker and return its consumer handle.
///
/// Must be called from within a tokio runtime.
pub fn spawn_bridge(
    connector: Arc<dyn SynthesisConnector>,
    request: BridgeRequest,
    settings: BridgeSettings,
) -> SynthesisStream {
    let sample_rate = negotiate_rate(request.requested_rate, &connector.supported_rates());
    let (tx, rx) = mpsc::channel(settings.channel_capacity.max(1));
    let cancel = CancellationToken::new();
    let error = Arc::new(OnceLock::new());

    let worker = Worker {
        connector,
        request,
        settings,
        sample_rate,
        tx,
        cancel: cancel.clone(),
        error: error.clone(),
    };
    tokio::spawn(worker.run());

    SynthesisStream {
        rx,
        cancel,
        error,
        sample_rate,
        ended: false,
    }
}

struct Worker {
    connector: Arc<dyn SynthesisConnector>,
    request: BridgeRequest,
    settings: BridgeSettings,
    sample_rate: u32,
    tx: mpsc::Sender<BridgeItem>,
    cancel: CancellationToken,
    error: Arc<OnceLock<ProviderError>>,
}

impl Worker {
    async fn run(self) {
        let mut guard = PanicGuard {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
            error: self.error.clone(),
            armed: true,
        };

        let terminal = CancellationToken::new();
        let events = Arc::new(BridgeEvents {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
            terminal: terminal.clone(),
            error: self.error.clone(),
            chunks: AtomicUsize::new(0),
        });

        let mut session: Option<Box<dyn SynthesisSession>> = None;
        let outcome = {
            let drive = self.drive(events.clone(), &terminal, &mut session);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Synthesis cancelled");
                    Ok(())
                }
                _ = tokio::time::sleep(self.settings.session_timeout) => {
                    Err(ProviderError::Timeout(self.settings.session_timeout.as_secs()))
                }
                result = drive => result,
            }
        };

        if let Some(mut session) = session.take() {
            session.close().await;
        }

        if let Err(e) = outcome {
            warn!(error = %e, model = %self.request.model, "Synthesis session failed");
            let _ = self.error.set(e);
        }

        self.cancel.cancel();
        if tokio::time::timeout(END_SEND_TIMEOUT, self.tx.send(BridgeItem::End))
            .await
            .is_err()
        {
            debug!("End marker not delivered; consumer is not draining");
        }

        info!(
            chunks = events.chunks.load(Ordering::Relaxed),
            sample_rate = self.sample_rate,
            "Synthesis session closed"
        );
        guard.armed = false;
    }

    async fn drive(
        &self,
        events: Arc<BridgeEvents>,
        terminal: &CancellationToken,
        slot: &mut Option<Box<dyn SynthesisSession>>,
    ) -> ProviderResult<()> {
        let session = slot.insert(self.connector.connect(&self.request.model, events).await?);

        session
            .configure(
                &self.request.voice,
                PcmFormat {
                    sample_rate: self.sample_rate,
                },
                &self.request.commit_mode,
            )
            .await?;

        match &self.request.input {
            SynthesisInput::Text(text) => {
                if !text.trim().is_empty() {
                    session.append_text(text).await?;
                }
            }
            SynthesisInput::Reply(reply) => {
                pump_reply(session.as_mut(), reply, terminal).await?;
            }
        }

        session.finish().await?;
        terminal.cancelled().await;
        Ok(())
    }
}

/// Stream the reply into the session through the flush policy, then record it.
async fn pump_reply(
    session: &mut dyn SynthesisSession,
    reply: &ReplyInput,
    terminal: &CancellationToken,
) -> ProviderResult<()> {
    let mut buffer = FlushBuffer::new(&reply.policy);
    let mut spoken = String::new();
    let mut use_blocking = false;

    match reply.generator.stream(&reply.turns).await {
        Ok(mut fragments) => {
            while let Some(item) = fragments.next().await {
                if terminal.is_cancelled() {
                    break;
                }
                match item {
                    Ok(fragment) => {
                        spoken.push_str(&fragment);
                        if let Some(text) = buffer.push(&fragment) {
                            session.append_text(&text).await?;
                        }
                    }
                    Err(e) if !buffer.flushed_any() => {
                        warn!(error = %e, "Reply stream failed early, using blocking reply");
                        use_blocking = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "Reply stream unavailable, using blocking reply");
            use_blocking = true;
        }
    }

    if use_blocking {
        spoken = reply.generator.complete(&reply.turns).await?;
        if !spoken.trim().is_empty() {
            session.append_text(&spoken).await?;
        }
    } else if let Some(rest) = buffer.finish() {
        session.append_text(&rest).await?;
    }

    let mut assistant = spoken.trim().to_string();
    if assistant.is_empty() {
        assistant = reply.fallback_reply.clone();
        session.append_text(&assistant).await?;
    }

    reply
        .store
        .append(&reply.device_id, Turn::new(Role::Assistant, assistant))
        .await;
    Ok(())
}

/// Event handler owned by one bridge worker.
struct BridgeEvents {
    tx: mpsc::Sender<BridgeItem>,
    cancel: CancellationToken,
    terminal: CancellationToken,
    error: Arc<OnceLock<ProviderError>>,
    chunks: AtomicUsize,
}

#[async_trait]
impl SynthesisEvents for BridgeEvents {
    async fn on_audio_delta(&self, pcm: Option<Vec<u8>>) {
        let Some(pcm) = pcm.filter(|p| !p.is_empty()) else {
            return;
        };
        if self.cancel.is_cancelled() || self.terminal.is_cancelled() {
            return;
        }

        tokio::select! {
            _ = self.cancel.cancelled() => {}
            sent = self.tx.send(BridgeItem::Chunk(pcm)) => {
                if sent.is_ok() {
                    self.chunks.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    async fn on_session_finished(&self) {
        self.terminal.cancel();
    }

    async fn on_error(&self, message: String) {
        let _ = self.error.set(ProviderError::Session(message));
        self.terminal.cancel();
    }
}

/// Cleanup for a worker that unwinds before reaching its normal exit.
struct PanicGuard {
    tx: mpsc::Sender<BridgeItem>,
    cancel: CancellationToken,
    error: Arc<OnceLock<ProviderError>>,
    armed: bool,
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let _ = self
            .error
            .set(ProviderError::Session("synthesis worker stopped unexpectedly".to_string()));
        self.cancel.cancel();
        let _ = self.tx.try_send(BridgeItem::End);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{FakeConnector, FakeReplies};

    fn text_request(text: &str) -> BridgeRequest {
        BridgeRequest {
            model: "tts".to_string(),
            voice: "Cherry".to_string(),
            commit_mode: "server_commit".to_string(),
            requested_rate: 16000,
            input: SynthesisInput::Text(text.to_string()),
        }
    }

    fn reply_request(replies: FakeReplies, store: &ConversationStore) -> BridgeRequest {
        BridgeRequest {
            input: SynthesisInput::Reply(ReplyInput {
                turns: vec![Turn::new(Role::User, "hi")],
                generator: Arc::new(replies),
                policy: FlushPolicy::default(),
                store: store.clone(),
                device_id: "dev".to_string(),
                fallback_reply: "sorry".to_string(),
            }),
            ..text_request("")
        }
    }

    async fn drain(stream: &mut SynthesisStream) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn test_chunks_then_end() {
        let connector = FakeConnector::with_chunks(vec![vec![1, 2], vec![3, 4], vec![5, 6]]);
        let mut stream = spawn_bridge(
            Arc::new(connector.clone()),
            text_request("hello"),
            BridgeSettings::default(),
        );

        assert_eq!(stream.sample_rate(), 24000);
        assert_eq!(drain(&mut stream).await, vec![vec![1, 2], vec![3, 4], vec![5, 6]]);
        assert!(stream.is_ended());
        assert!(stream.is_cancelled());
        assert!(stream.error().is_none());
        assert_eq!(connector.texts(), vec!["hello".to_string()]);
        assert!(connector.closed());
    }

    #[tokio::test]
    async fn test_cancel_before_any_chunk() {
        let connector = FakeConnector::with_chunks(vec![vec![1, 2]; 4]);
        let mut stream = spawn_bridge(
            Arc::new(connector),
            text_request("hello"),
            BridgeSettings::default(),
        );
        stream.cancel();

        assert!(drain(&mut stream).await.is_empty());
        assert!(stream.is_ended());
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_keeps_order() {
        let chunks: Vec<Vec<u8>> = (0..50u8).map(|i| vec![i, i]).collect();
        let connector = FakeConnector::with_chunks(chunks).delayed(Duration::from_millis(1));
        let mut stream = spawn_bridge(
            Arc::new(connector),
            text_request("hello"),
            BridgeSettings::default(),
        );

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(stream.recv().await.unwrap());
        }
        stream.cancel();
        seen.extend(drain(&mut stream).await);

        assert!(seen.len() < 50);
        for (i, chunk) in seen.iter().enumerate() {
            assert_eq!(chunk, &vec![i as u8, i as u8]);
        }
    }

    #[tokio::test]
    async fn test_connect_failure_is_captured() {
        let connector = FakeConnector::failing();
        let mut stream = spawn_bridge(
            Arc::new(connector),
            text_request("hello"),
            BridgeSettings::default(),
        );

        assert!(drain(&mut stream).await.is_empty());
        assert!(matches!(stream.error(), Some(ProviderError::Transport(_))));
    }

    #[tokio::test]
    async fn test_session_error_event_is_captured() {
        let connector = FakeConnector::with_chunks(vec![vec![1, 2]]).erroring("boom");
        let mut stream = spawn_bridge(
            Arc::new(connector.clone()),
            text_request("hello"),
            BridgeSettings::default(),
        );

        assert_eq!(drain(&mut stream).await, vec![vec![1, 2]]);
        assert!(matches!(stream.error(), Some(ProviderError::Session(m)) if m == "boom"));
        assert!(connector.closed());
    }

    #[tokio::test]
    async fn test_session_timeout() {
        let connector = FakeConnector::with_chunks(vec![]).silent();
        let settings = BridgeSettings {
            session_timeout: Duration::from_millis(50),
            ..BridgeSettings::default()
        };
        let mut stream = spawn_bridge(Arc::new(connector.clone()), text_request("hello"), settings);

        assert!(drain(&mut stream).await.is_empty());
        assert!(matches!(stream.error(), Some(ProviderError::Timeout(_))));
        assert!(connector.closed());
    }

    #[tokio::test]
    async fn test_reply_is_flushed_and_remembered() {
        let store = ConversationStore::new("sys", 12);
        let connector = FakeConnector::with_chunks(vec![vec![0, 0]]);
        let replies = FakeReplies::streaming(&["你好", "，我是", "语音助手。", "有事吗"]);

        let mut stream = spawn_bridge(
            Arc::new(connector.clone()),
            reply_request(replies, &store),
            BridgeSettings::default(),
        );
        drain(&mut stream).await;

        assert_eq!(
            connector.texts(),
            vec!["你好，我是语音助手。".to_string(), "有事吗".to_string()]
        );
        let history = store.snapshot("dev").await;
        assert_eq!(
            history.last(),
            Some(&Turn::new(Role::Assistant, "你好，我是语音助手。有事吗"))
        );
    }

    #[tokio::test]
    async fn test_reply_falls_back_to_blocking_call() {
        let store = ConversationStore::new("sys", 12);
        let connector = FakeConnector::with_chunks(vec![vec![0, 0]]);
        let replies = FakeReplies::stream_unavailable("blocking answer");

        let mut stream = spawn_bridge(
            Arc::new(connector.clone()),
            reply_request(replies, &store),
            BridgeSettings::default(),
        );
        drain(&mut stream).await;

        assert!(stream.error().is_none());
        assert_eq!(connector.texts(), vec!["blocking answer".to_string()]);
        assert_eq!(
            store.snapshot("dev").await.last(),
            Some(&Turn::new(Role::Assistant, "blocking answer"))
        );
    }

    #[tokio::test]
    async fn test_early_stream_error_falls_back_to_blocking_call() {
        let store = ConversationStore::new("sys", 12);
        let connector = FakeConnector::with_chunks(vec![vec![0, 0]]);
        let replies = FakeReplies::failing_after(&["abc"], "blocking");

        let mut stream = spawn_bridge(
            Arc::new(connector.clone()),
            reply_request(replies, &store),
            BridgeSettings::default(),
        );
        assert_eq!(drain(&mut stream).await, vec![vec![0, 0]]);

        assert!(stream.error().is_none());
        assert_eq!(connector.texts(), vec!["blocking".to_string()]);
        assert_eq!(
            store.snapshot("dev").await.last(),
            Some(&Turn::new(Role::Assistant, "blocking"))
        );
    }

    #[tokio::test]
    async fn test_stream_error_after_flush_is_not_spoken_twice() {
        let store = ConversationStore::new("sys", 12);
        let connector = FakeConnector::with_chunks(vec![vec![0, 0]]);
        let replies = FakeReplies::failing_after(&["你好，我是语音助手。"], "blocking");

        let mut stream = spawn_bridge(
            Arc::new(connector.clone()),
            reply_request(replies, &store),
            BridgeSettings::default(),
        );
        assert!(drain(&mut stream).await.is_empty());

        assert!(matches!(stream.error(), Some(ProviderError::Http(_))));
        assert_eq!(connector.texts(), vec!["你好，我是语音助手。".to_string()]);
        assert!(connector.closed());
        assert_eq!(store.snapshot("dev").await.len(), 1);
    }

    #[tokio::test]
    async fn test_slow_consumer_gets_every_chunk_in_order() {
        let chunks: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i, i]).collect();
        let connector = FakeConnector::with_chunks(chunks.clone());
        let settings = BridgeSettings {
            channel_capacity: 1,
            ..BridgeSettings::default()
        };
        let mut stream = spawn_bridge(Arc::new(connector), text_request("hello"), settings);

        let mut seen = Vec::new();
        while let Some(chunk) = stream.recv().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
            seen.push(chunk);
        }

        assert_eq!(seen, chunks);
        assert!(stream.error().is_none());
    }

    #[tokio::test]
    async fn test_empty_reply_speaks_fallback() {
        let store = ConversationStore::new("sys", 12);
        let connector = FakeConnector::with_chunks(vec![vec![0, 0]]);
        let replies = FakeReplies::streaming(&[]);

        let mut stream = spawn_bridge(
            Arc::new(connector.clone()),
            reply_request(replies, &store),
            BridgeSettings::default(),
        );
        drain(&mut stream).await;

        assert_eq!(connector.texts(), vec!["sorry".to_string()]);
        assert_eq!(
            store.snapshot("dev").await.last(),
            Some(&Turn::new(Role::Assistant, "sorry"))
        );
    }
}
