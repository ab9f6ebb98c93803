//! # Realtime Synthesis Client
//!
//! WebSocket client for a realtime text-to-speech service.
//!
//! ## Protocol:
//! Client events (JSON text frames):
//! - `session.update`: voice, `pcm` response format, sample rate and commit mode
//! - `input_text_buffer.append`: one piece of text to speak
//! - `session.finish`: no more text follows
//!
//! Server events:
//! - `response.audio.delta`: base64 PCM in `delta`
//! - `session.finished`: all audio has been delivered
//! - `error`: the session failed
//!
//! A reader task owns the receiving half of the socket and forwards decoded
//! events to the session's [`SynthesisEvents`] handler. It stops at the first
//! `session.finished` or `error` event.

use crate::config::AppConfig;
use crate::error::{ProviderError, ProviderResult};
use crate::providers::{PcmFormat, SynthesisConnector, SynthesisEvents, SynthesisSession};
use async_trait::async_trait;
use base64::Engine;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Opens sessions against the realtime endpoint configured in `provider`.
#[derive(Debug, Clone)]
pub struct RealtimeConnector {
    url: String,
    api_key: String,
    supported_rates: Vec<u32>,
}

impl RealtimeConnector {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            url: config.provider.realtime_ws_url.clone(),
            api_key: config.provider.api_key.clone(),
            supported_rates: config.speech.supported_output_rates.clone(),
        }
    }
}

#[async_trait]
impl SynthesisConnector for RealtimeConnector {
    fn supported_rates(&self) -> Vec<u32> {
        self.supported_rates.clone()
    }

    async fn connect(
        &self,
        model: &str,
        events: Arc<dyn SynthesisEvents>,
    ) -> ProviderResult<Box<dyn SynthesisSession>> {
        if self.api_key.is_empty() {
            return Err(ProviderError::NotConfigured(
                "DASHSCOPE_API_KEY is not set".to_string(),
            ));
        }

        let mut request = format!("{}?model={}", self.url, model).into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| ProviderError::NotConfigured(format!("invalid api key: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (socket, _) = tokio_tungstenite::connect_async(request).await?;
        info!(model, "Realtime synthesis session connected");

        let (sink, mut stream) = socket.split();

        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => {
                        debug!("Realtime synthesis socket closed by server");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        events.on_error(format!("receive failed: {}", e)).await;
                        break;
                    }
                };

                match parse_server_event(&text) {
                    ServerEvent::AudioDelta(pcm) => events.on_audio_delta(pcm).await,
                    ServerEvent::Finished => {
                        events.on_session_finished().await;
                        break;
                    }
                    ServerEvent::Error(message) => {
                        events.on_error(message).await;
                        break;
                    }
                    ServerEvent::Other => {}
                }
            }
        });

        Ok(Box::new(RealtimeSession {
            sink,
            reader: Some(reader),
        }))
    }
}

/// One open realtime session.
pub struct RealtimeSession {
    sink: WsSink,
    reader: Option<JoinHandle<()>>,
}

impl RealtimeSession {
    async fn send_event(&mut self, event: Value) -> ProviderResult<()> {
        self.sink.send(Message::Text(event.to_string())).await?;
        Ok(())
    }
}

#[async_trait]
impl SynthesisSession for RealtimeSession {
    async fn configure(
        &mut self,
        voice: &str,
        format: PcmFormat,
        commit_mode: &str,
    ) -> ProviderResult<()> {
        self.send_event(session_update(voice, format, commit_mode)).await
    }

    async fn append_text(&mut self, text: &str) -> ProviderResult<()> {
        self.send_event(json!({"type": "input_text_buffer.append", "text": text}))
            .await
    }

    async fn finish(&mut self) -> ProviderResult<()> {
        self.send_event(json!({"type": "session.finish"})).await
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "Closing realtime synthesis socket failed");
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

fn session_update(voice: &str, format: PcmFormat, commit_mode: &str) -> Value {
    json!({
        "type": "session.update",
        "session": {
            "voice": voice,
            "response_format": "pcm",
            "sample_rate": format.sample_rate,
            "mode": commit_mode,
        }
    })
}

/// Server event as seen by the reader task.
#[derive(Debug, PartialEq, Eq)]
pub enum ServerEvent {
    AudioDelta(Option<Vec<u8>>),
    Finished,
    Error(String),
    Other,
}

pub fn parse_server_event(text: &str) -> ServerEvent {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Unparsable realtime synthesis event");
            return ServerEvent::Other;
        }
    };

    match value.get("type").and_then(Value::as_str) {
        Some("response.audio.delta") => {
            let pcm = value
                .get("delta")
                .and_then(Value::as_str)
                .filter(|delta| !delta.is_empty())
                .and_then(|delta| {
                    base64::engine::general_purpose::STANDARD
                        .decode(delta)
                        .map_err(|e| warn!(error = %e, "Audio delta is not valid base64"))
                        .ok()
                });
            ServerEvent::AudioDelta(pcm)
        }
        Some("session.finished") => ServerEvent::Finished,
        Some("error") => {
            let message = value
                .pointer("/error/message")
                .or_else(|| value.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string());
            ServerEvent::Error(message)
        }
        _ => ServerEvent::Other,
    }
}
