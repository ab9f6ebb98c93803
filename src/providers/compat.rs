//! OpenAI-compatible REST client.
//!
//! Covers speech recognition (`/audio/transcriptions`, falling back to
//! `/chat/completions` with an `input_audio` part when the provider does not
//! expose the transcription route) and chat completions, blocking or
//! streamed as server-sent events.

use crate::config::AppConfig;
use crate::conversation::Turn;
use crate::error::{ProviderError, ProviderResult};
use crate::providers::{FragmentStream, ReplyGenerator, Transcriber, TranscriptionRequest};
use async_trait::async_trait;
use base64::Engine;
use futures_util::{future, StreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio_stream::wrappers::LinesStream;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

/// Client for recognition and chat on an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct CompatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    asr_model: String,
    llm_model: String,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Turn],
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

impl CompatClient {
    pub fn new(config: &AppConfig) -> ProviderResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.provider.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.provider.compat_base_url.trim_end_matches('/').to_string(),
            api_key: config.provider.api_key.clone(),
            asr_model: config.models.asr_model.clone(),
            llm_model: config.models.llm_model.clone(),
            max_tokens: config.conversation.max_tokens,
            temperature: config.conversation.temperature,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn api_key(&self) -> ProviderResult<&str> {
        if self.api_key.is_empty() {
            return Err(ProviderError::NotConfigured(
                "DASHSCOPE_API_KEY is not set".to_string(),
            ));
        }
        Ok(&self.api_key)
    }

    async fn post_chat(&self, messages: &[Turn], stream: bool) -> ProviderResult<reqwest::Response> {
        let body = ChatRequest {
            model: &self.llm_model,
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream,
        };

        let response = self
            .http
            .post(self.url("chat/completions"))
            .bearer_auth(self.api_key()?)
            .json(&body)
            .send()
            .await?;

        ensure_success(response).await
    }

    /// Recognition through chat completions with the audio inlined as a data URL.
    async fn transcribe_via_chat(&self, wav: &[u8]) -> ProviderResult<String> {
        let data_url = format!(
            "data:audio/wav;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(wav)
        );
        let payload = json!({
            "model": self.asr_model,
            "messages": [{
                "role": "user",
                "content": [{"type": "input_audio", "input_audio": {"data": data_url}}]
            }]
        });

        let response = self
            .http
            .post(self.url("chat/completions"))
            .bearer_auth(self.api_key()?)
            .json(&payload)
            .send()
            .await?;

        let value: Value = ensure_success(response).await?.json().await?;
        let text = message_content(&value)?;
        non_empty(text)
    }
}

#[async_trait]
impl Transcriber for CompatClient {
    async fn transcribe(&self, request: TranscriptionRequest<'_>) -> ProviderResult<String> {
        let file = Part::bytes(request.audio.to_vec())
            .file_name("audio.wav")
            .mime_str("audio/wav")?;
        let form = Form::new()
            .part("file", file)
            .text("model", self.asr_model.clone())
            .text("language", request.language.to_string());

        debug!(
            bytes = request.audio.len(),
            sample_rate = request.sample_rate,
            model = %self.asr_model,
            "Sending audio for transcription"
        );

        let response = self
            .http
            .post(self.url("audio/transcriptions"))
            .bearer_auth(self.api_key()?)
            .multipart(form)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                let value: Value = response.json().await?;
                let text = value
                    .get("text")
                    .or_else(|| value.get("transcript"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                non_empty(text.to_string())
            }
            StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED => {
                warn!("Transcription route unavailable, using chat completions input_audio");
                self.transcribe_via_chat(request.audio).await
            }
            status => Err(ProviderError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

#[async_trait]
impl ReplyGenerator for CompatClient {
    async fn complete(&self, turns: &[Turn]) -> ProviderResult<String> {
        let value: Value = self.post_chat(turns, false).await?.json().await?;
        Ok(message_content(&value)?.trim().to_string())
    }

    async fn stream(&self, turns: &[Turn]) -> ProviderResult<FragmentStream> {
        let response = self.post_chat(turns, true).await?;

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        let lines = LinesStream::new(StreamReader::new(body).lines());

        let fragments = lines
            .map(|line| {
                line.map(|l| parse_sse_line(&l))
                    .map_err(|e| ProviderError::Http(e.to_string()))
            })
            .take_while(|item| future::ready(!matches!(item, Ok(SseLine::Done))))
            .filter_map(|item| {
                future::ready(match item {
                    Ok(SseLine::Data(text)) => Some(Ok(text)),
                    Ok(_) => None,
                    Err(e) => Some(Err(e)),
                })
            });

        Ok(fragments.boxed())
    }
}

/// One decoded line of a chat-completions event stream.
#[derive(Debug, PartialEq, Eq)]
pub enum SseLine {
    /// Text delta
    Data(String),
    /// `[DONE]` sentinel
    Done,
    /// Comment, keep-alive, role-only delta or unparsable payload
    Skip,
}

pub fn parse_sse_line(raw: &str) -> SseLine {
    let Some(payload) = raw.trim().strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let payload = payload.trim();

    if payload.is_empty() {
        return SseLine::Skip;
    }
    if payload == "[DONE]" {
        return SseLine::Done;
    }

    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        return SseLine::Skip;
    };

    match value.pointer("/choices/0/delta/content").and_then(Value::as_str) {
        Some(text) => {
            let text = text.trim_matches('\r');
            if text.is_empty() {
                SseLine::Skip
            } else {
                SseLine::Data(text.to_string())
            }
        }
        None => SseLine::Skip,
    }
}

async fn ensure_success(response: reqwest::Response) -> ProviderResult<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Status { status, body })
}

fn message_content(value: &Value) -> ProviderResult<String> {
    match value.pointer("/choices/0/message/content") {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(Value::Null) => Ok(String::new()),
        _ => Err(ProviderError::BadResponse(value.to_string())),
    }
}

fn non_empty(text: String) -> ProviderResult<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ProviderError::EmptyTranscript);
    }
    Ok(trimmed.to_string())
}
