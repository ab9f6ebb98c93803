//! # Voice WebSocket
//!
//! `GET /ws` upgrades to a WebSocket served by one [`VoiceWebSocket`] actor.
//! The actor is a thin transport shell around a
//! [`ConnectionSession`](crate::pipeline::connection::ConnectionSession):
//!
//! - incoming text and binary frames go straight to the session, in order
//! - everything the session wants to send arrives on one bounded queue that
//!   the actor drains as a second stream
//! - protocol pings keep idle connections alive; a client silent for
//!   [`CLIENT_TIMEOUT`] is dropped
//!
//! The device identifier comes from the `device-id` header, falling back to
//! `x-device-id`, then to the shared anonymous bucket.

use crate::error::AppError;
use crate::pipeline::connection::{ConnectionSession, Outgoing};
use crate::state::{AppState, ConnectionSlot};
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct VoiceWebSocket {
    session: ConnectionSession,
    outbound: Option<mpsc::Receiver<Outgoing>>,
    last_heartbeat: Instant,
    _slot: ConnectionSlot,
}

impl VoiceWebSocket {
    fn new(
        session: ConnectionSession,
        outbound: mpsc::Receiver<Outgoing>,
        slot: ConnectionSlot,
    ) -> Self {
        Self {
            session,
            outbound: Some(outbound),
            last_heartbeat: Instant::now(),
            _slot: slot,
        }
    }
}

impl Actor for VoiceWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(
            session_id = %self.session.session_id(),
            device_id = %self.session.device_id(),
            "Voice connection started"
        );

        if let Some(rx) = self.outbound.take() {
            ctx.add_stream(ReceiverStream::new(rx));
        }

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session_id = %act.session.session_id(), "Heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.session.teardown();
        info!(session_id = %self.session.session_id(), "Voice connection stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();
        match msg {
            Ok(ws::Message::Text(text)) => self.session.handle_text(&text),
            Ok(ws::Message::Binary(data)) => self.session.handle_binary(&data),
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session.session_id(), ?reason, "Client closed connection");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                debug!("Ignoring continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session.session_id(), "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Frames queued by the connection session.
impl StreamHandler<Outgoing> for VoiceWebSocket {
    fn handle(&mut self, msg: Outgoing, ctx: &mut Self::Context) {
        match msg {
            Outgoing::Text(text) => ctx.text(text),
            Outgoing::Audio(pcm) => ctx.binary(pcm),
        }
    }

    // The session keeps its sender for the life of the connection.
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

fn device_id_from(req: &HttpRequest) -> String {
    ["device-id", "x-device-id"]
        .iter()
        .filter_map(|name| req.headers().get(*name))
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .find(|value| !value.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// WebSocket endpoint handler.
///
/// Rejects the upgrade with 503 once `performance.max_concurrent_sessions`
/// connections are live.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let slot = state.try_acquire_connection().ok_or_else(|| {
        warn!(
            active = state.active_connections(),
            "Rejecting voice connection, all slots taken"
        );
        AppError::Unavailable("too many concurrent voice sessions".to_string())
    })?;

    let device_id = device_id_from(&req);
    debug!(
        peer = ?req.connection_info().peer_addr(),
        device_id = %device_id,
        "Voice connection request"
    );

    let (tx, rx) = mpsc::channel(state.config.performance.channel_capacity);
    let session = ConnectionSession::new(&device_id, state.pipeline.clone(), tx);

    ws::start(VoiceWebSocket::new(session, rx, slot), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::state::tests::test_state;
    use actix_web::http::StatusCode;
    use actix_web::{test as actix_test, App};

    fn upgrade_request() -> actix_test::TestRequest {
        actix_test::TestRequest::get()
            .uri("/ws")
            .insert_header(("upgrade", "websocket"))
            .insert_header(("connection", "upgrade"))
            .insert_header(("sec-websocket-version", "13"))
            .insert_header(("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="))
    }

    #[test]
    fn test_device_id_header_precedence() {
        let req = actix_test::TestRequest::default()
            .insert_header(("device-id", "kitchen"))
            .insert_header(("x-device-id", "hallway"))
            .to_http_request();
        assert_eq!(device_id_from(&req), "kitchen");

        let req = actix_test::TestRequest::default()
            .insert_header(("device-id", "  "))
            .insert_header(("x-device-id", "hallway"))
            .to_http_request();
        assert_eq!(device_id_from(&req), "hallway");

        let req = actix_test::TestRequest::default().to_http_request();
        assert_eq!(device_id_from(&req), "");
    }

    #[actix_web::test]
    async fn test_upgrade_switches_protocols() {
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(test_state(AppConfig::default())))
                .route("/ws", web::get().to(voice_websocket)),
        )
        .await;

        let resp = actix_test::call_service(&app, upgrade_request().to_request()).await;
        assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);
    }

    #[actix_web::test]
    async fn test_upgrade_rejected_when_full() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 1;
        let state = test_state(config);
        let _held = state.try_acquire_connection();

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws", web::get().to(voice_websocket)),
        )
        .await;

        let resp = actix_test::call_service(&app, upgrade_request().to_request()).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.get_metrics_snapshot().connections_rejected, 1);
    }
}
