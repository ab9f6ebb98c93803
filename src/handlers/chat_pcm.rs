//! Non-interactive voice turn over plain HTTP.
//!
//! `POST /chat_pcm` takes one utterance as an `audio/wav` body and answers
//! with the spoken reply as a single streamed body of raw 16-bit mono PCM:
//!
//! ```text
//! Content-Type: audio/L16;rate=16000;channels=1
//! X-Audio-Sample-Rate: 16000
//! X-Audio-Channels: 1
//! X-Audio-Format: S16LE
//! ```
//!
//! Failures before the first audio byte become JSON error responses. Once
//! streaming has started a failure simply ends the body early.

use crate::audio::encode::wav_sample_rate;
use crate::audio::resample::StreamResampler;
use crate::conversation::{ConversationStore, Role, Turn};
use crate::error::{AppError, AppResult};
use crate::pipeline::bridge::SynthesisStream;
use crate::state::AppState;
use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use bytes::Bytes;
use futures_util::stream;
use std::convert::Infallible;
use tracing::{info, warn};

pub async fn chat_pcm(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if !content_type.contains("audio/wav") {
        return Err(AppError::BadRequest("Content-Type must be audio/wav".to_string()));
    }
    if body.is_empty() {
        return Err(AppError::BadRequest("empty wav".to_string()));
    }

    let input_rate = wav_sample_rate(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid wav body: {}", e)))?;
    let device_id = ConversationStore::device_key(
        req.headers()
            .get("x-device-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default(),
    );

    let pipeline = &state.pipeline;
    let text = pipeline.transcribe_wav(&body, input_rate).await?;
    info!(device_id = %device_id, text = %text, "Transcribed HTTP utterance");

    let turns = pipeline
        .memory
        .append(&device_id, Turn::new(Role::User, text))
        .await;

    let mut synthesis = pipeline.start_reply(&device_id, turns);
    let first = synthesis.recv().await;
    if first.is_none() {
        if let Some(e) = synthesis.error() {
            return Err(e.into());
        }
    }

    let output_rate = pipeline.settings.output_sample_rate;
    let resampler = StreamResampler::new(synthesis.sample_rate(), output_rate);
    let body = pcm_body(PcmBody {
        synthesis,
        resampler,
        pending: first,
    });

    Ok(HttpResponse::Ok()
        .content_type(format!("audio/L16;rate={};channels=1", output_rate))
        .insert_header(("X-Audio-Sample-Rate", output_rate.to_string()))
        .insert_header(("X-Audio-Channels", "1"))
        .insert_header(("X-Audio-Format", "S16LE"))
        .streaming(body))
}

struct PcmBody {
    synthesis: SynthesisStream,
    resampler: StreamResampler,
    pending: Option<Vec<u8>>,
}

/// Resampled PCM until the bridge ends. Dropping the body cancels synthesis.
fn pcm_body(state: PcmBody) -> impl futures_util::Stream<Item = Result<Bytes, Infallible>> {
    stream::unfold(state, |mut body| async move {
        loop {
            let chunk = match body.pending.take() {
                Some(chunk) => chunk,
                None => match body.synthesis.recv().await {
                    Some(chunk) => chunk,
                    None => {
                        if let Some(e) = body.synthesis.error() {
                            warn!(error = %e, "Streamed reply ended early");
                        }
                        return None;
                    }
                },
            };

            let pcm = body.resampler.process(&chunk);
            if !pcm.is_empty() {
                return Some((Ok(Bytes::from(pcm)), body));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::encode::pcm_to_wav;
    use crate::config::AppConfig;
    use crate::pipeline::testing::{fake_pipeline, FakeConnector, FakeReplies, FakeTranscriber};
    use crate::state::tests::test_state;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};

    fn app_with(
        state: AppState,
    ) -> App<
        impl actix_web::dev::ServiceFactory<
            actix_web::dev::ServiceRequest,
            Config = (),
            Response = actix_web::dev::ServiceResponse,
            Error = actix_web::Error,
            InitError = (),
        >,
    > {
        App::new()
            .app_data(web::Data::new(state))
            .route("/chat_pcm", web::post().to(chat_pcm))
    }

    #[actix_web::test]
    async fn test_streams_pcm_with_sidecar_headers() {
        let state = test_state(AppConfig::default());
        let app = test::init_service(app_with(state.clone())).await;

        let wav = pcm_to_wav(&[0u8; 3200], 16000).unwrap();
        let req = test::TestRequest::post()
            .uri("/chat_pcm")
            .insert_header((header::CONTENT_TYPE, "audio/wav"))
            .insert_header(("x-device-id", "kitchen"))
            .set_payload(wav)
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::OK);
        let headers = resp.headers();
        for (name, expected) in [
            ("content-type", "audio/L16;rate=16000;channels=1"),
            ("x-audio-sample-rate", "16000"),
            ("x-audio-channels", "1"),
            ("x-audio-format", "S16LE"),
        ] {
            assert_eq!(headers.get(name).unwrap(), expected, "header {}", name);
        }

        let body = test::read_body(resp).await;
        assert!(!body.is_empty());
        assert_eq!(body.len() % 2, 0);

        let history = state.pipeline.memory.snapshot("kitchen").await;
        assert_eq!(history[1], Turn::new(Role::User, "hello"));
        assert_eq!(history[2].role, Role::Assistant);
    }

    #[actix_web::test]
    async fn test_rejects_bad_requests() {
        let app = test::init_service(app_with(test_state(AppConfig::default()))).await;

        let wrong_type = test::TestRequest::post()
            .uri("/chat_pcm")
            .insert_header((header::CONTENT_TYPE, "application/json"))
            .set_payload("{}")
            .to_request();
        assert_eq!(test::call_service(&app, wrong_type).await.status(), StatusCode::BAD_REQUEST);

        let empty = test::TestRequest::post()
            .uri("/chat_pcm")
            .insert_header((header::CONTENT_TYPE, "audio/wav"))
            .to_request();
        assert_eq!(test::call_service(&app, empty).await.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_provider_failure_before_audio_is_bad_gateway() {
        let pipeline = fake_pipeline(
            FakeTranscriber::returning("hello"),
            FakeReplies::streaming(&["hi"]),
            FakeConnector::failing(),
        );
        let state = AppState::new(AppConfig::default(), pipeline);
        let app = test::init_service(app_with(state)).await;

        let req = test::TestRequest::post()
            .uri("/chat_pcm")
            .insert_header((header::CONTENT_TYPE, "audio/wav"))
            .set_payload(pcm_to_wav(&[0u8; 3200], 16000).unwrap())
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "upstream_error");
    }
}
