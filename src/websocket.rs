//! # WebSocket Transcription Endpoint
//!
//! `GET /ws/transcribe?language=<code>` upgrades to a WebSocket bound to one
//! streaming session.
//!
//! ## Connection Lifecycle:
//! 1. **Upgrade**: a session id is generated and the session is registered; the
//!    client receives `connected` (plus an `error` if the language hint was refused)
//! 2. **Streaming**: binary frames are raw audio payloads, text frames are JSON
//!    client messages (`audio_chunk`, `change_language`, `ping`)
//! 3. **Results**: transcription outcomes arrive on the session's reply channel,
//!    which the actor drains as a second stream, so every write to the socket
//!    happens on the actor's own context
//! 4. **Teardown**: close frames, protocol errors, heartbeat timeouts and actor
//!    shutdown all end in `ProtocolHandler::disconnect`
//!
//! When the registry is full the client gets one `error` event and the socket is
//! closed with code 1013 (try again later). Frames larger than
//! `server.max_frame_bytes` end the connection with code 1009 (message too big).

use crate::audio::registry::SessionRegistry;
use crate::audio::session::SessionContext;
use crate::error::SessionError;
use crate::protocol::{ProtocolHandler, ServerEvent};
use crate::state::AppState;
use crate::transcription::pool::TranscriptionOutcome;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    pub language: Option<String>,
}

/// Actor owning one WebSocket connection and its session.
pub struct TranscriptionSocket {
    session_id: String,
    language_hint: Option<String>,
    context: SessionContext,
    registry: Arc<SessionRegistry>,
    /// Set once the session is registered in `started`
    handler: Option<ProtocolHandler>,
    heartbeat_interval: Duration,
    client_timeout: Duration,
    last_heartbeat: Instant,
    max_frame_bytes: usize,
}

impl TranscriptionSocket {
    pub fn new(state: &AppState, language_hint: Option<String>) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            language_hint,
            context: state.session_context.clone(),
            registry: state.registry.clone(),
            handler: None,
            heartbeat_interval: Duration::from_secs(state.config.server.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(state.config.server.client_timeout_secs),
            last_heartbeat: Instant::now(),
            max_frame_bytes: state.config.server.max_frame_bytes,
        }
    }

    fn send_event(&self, event: &ServerEvent, ctx: &mut ws::WebsocketContext<Self>) {
        match event.to_json() {
            Ok(json) => ctx.text(json),
            Err(e) => error!(session_id = %self.session_id, "Failed to serialize event: {}", e),
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let timeout = self.client_timeout;
        ctx.run_interval(self.heartbeat_interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > timeout {
                warn!(session_id = %act.session_id, "Client heartbeat timed out, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

/// Close frame sent when a session cannot be opened.
fn refusal_reason(error: &SessionError) -> ws::CloseReason {
    let code = match error {
        SessionError::Capacity(_) => ws::CloseCode::Again,
        _ => ws::CloseCode::Error,
    };
    ws::CloseReason {
        code,
        description: Some(error.to_string()),
    }
}

fn oversized_frame_error(limit: usize) -> SessionError {
    SessionError::Transport(format!("frame exceeds the {} byte limit", limit))
}

impl Actor for TranscriptionSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let connected = ProtocolHandler::connect(
            self.session_id.clone(),
            self.context.clone(),
            self.registry.clone(),
            self.language_hint.as_deref(),
        );

        match connected {
            Ok((handler, outcomes, events)) => {
                info!(
                    session_id = %self.session_id,
                    language = %handler.session().language(),
                    "WebSocket session started"
                );
                for event in &events {
                    self.send_event(event, ctx);
                }
                ctx.add_stream(UnboundedReceiverStream::new(outcomes));
                self.handler = Some(handler);
                self.start_heartbeat(ctx);
            }
            Err(e) => {
                warn!(session_id = %self.session_id, "Refusing WebSocket session: {}", e);
                self.send_event(&ServerEvent::error(&e), ctx);
                ctx.close(Some(refusal_reason(&e)));
                ctx.stop();
            }
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(handler) = &self.handler {
            if handler.disconnect() {
                info!(session_id = %self.session_id, "WebSocket session closed");
            }
        }
    }
}

/// Frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for TranscriptionSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        let handler = match &self.handler {
            Some(handler) => handler,
            None => return,
        };

        let reply = match msg {
            Ok(ws::Message::Text(text)) => handler.handle_text(&text),
            Ok(ws::Message::Binary(data)) => handler.handle_binary(&data),
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                None
            }
            Ok(ws::Message::Pong(_)) | Ok(ws::Message::Nop) => None,
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "Ignoring continuation frame");
                None
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(session_id = %self.session_id, "Client closed connection: {:?}", reason);
                handler.disconnect();
                ctx.close(reason);
                ctx.stop();
                None
            }
            Err(ws::ProtocolError::Overflow) => {
                warn!(
                    session_id = %self.session_id,
                    limit = self.max_frame_bytes,
                    "Frame exceeds the configured limit, closing connection"
                );
                let e = oversized_frame_error(self.max_frame_bytes);
                self.send_event(&ServerEvent::error(&e), ctx);
                handler.disconnect();
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Size,
                    description: Some(e.to_string()),
                }));
                ctx.stop();
                None
            }
            Err(e) => {
                error!(session_id = %self.session_id, "WebSocket protocol error: {}", e);
                handler.disconnect();
                ctx.stop();
                None
            }
        };

        if let Some(event) = reply {
            self.send_event(&event, ctx);
        }
    }
}

/// Finished transcription jobs for this session.
impl StreamHandler<TranscriptionOutcome> for TranscriptionSocket {
    fn handle(&mut self, outcome: TranscriptionOutcome, ctx: &mut Self::Context) {
        let event = self
            .handler
            .as_ref()
            .and_then(|handler| handler.handle_outcome(outcome));
        if let Some(event) = event {
            self.send_event(&event, ctx);
        }
    }

    // The reply channel only ends with the session; the socket's own lifecycle
    // decides when the actor stops.
    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!(session_id = %self.session_id, "Outcome stream finished");
    }
}

/// `GET /ws/transcribe`
pub async fn transcribe_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    query: web::Query<ConnectQuery>,
) -> Result<HttpResponse, actix_web::Error> {
    debug!(
        peer = ?req.connection_info().peer_addr(),
        language = ?query.language,
        "WebSocket upgrade requested"
    );

    let socket = TranscriptionSocket::new(&state, query.into_inner().language);
    let max_frame_bytes = socket.max_frame_bytes;
    ws::WsResponseBuilder::new(socket, &req, stream)
        .frame_size(max_frame_bytes)
        .start()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::state::testing::test_state;
    use actix_web::http::{header, StatusCode};
    use actix_web::{test as atest, App};

    #[test]
    fn test_capacity_refusal_asks_client_to_retry() {
        let reason = refusal_reason(&SessionError::Capacity(2));
        assert_eq!(reason.code, ws::CloseCode::Again);
        assert!(reason.description.unwrap().contains('2'));

        let reason = refusal_reason(&SessionError::Transport("duplicate".to_string()));
        assert_eq!(reason.code, ws::CloseCode::Error);
    }

    #[actix_web::test]
    async fn test_socket_takes_settings_from_state() {
        let mut config = AppConfig::default();
        config.server.heartbeat_interval_secs = 5;
        config.server.client_timeout_secs = 12;
        config.server.max_frame_bytes = 256 * 1024;
        let state = test_state(config);

        let first = TranscriptionSocket::new(&state, Some("yo".to_string()));
        let second = TranscriptionSocket::new(&state, None);

        assert_ne!(first.session_id, second.session_id);
        assert_eq!(first.language_hint.as_deref(), Some("yo"));
        assert_eq!(first.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(first.client_timeout, Duration::from_secs(12));
        assert_eq!(first.max_frame_bytes, 256 * 1024);
        assert!(first.handler.is_none());
        assert!(state.registry.is_empty());
    }

    #[actix_web::test]
    async fn test_plain_http_request_is_not_upgraded() {
        let app = atest::init_service(
            App::new()
                .app_data(web::Data::new(test_state(AppConfig::default())))
                .route("/ws/transcribe", web::get().to(transcribe_websocket)),
        )
        .await;

        let req = atest::TestRequest::get()
            .uri("/ws/transcribe?language=en")
            .to_request();
        let resp = atest::call_service(&app, req).await;
        assert!(resp.status().is_client_error());
    }

    #[test]
    fn test_oversized_frame_error_names_the_limit() {
        let e = oversized_frame_error(8 * 1024 * 1024);
        assert!(e.is_fatal());
        assert!(e.to_string().contains("8388608"));
    }

    #[actix_web::test]
    async fn test_upgrade_handshake_accepts_frames_up_to_configured_limit() {
        let mut config = AppConfig::default();
        config.server.max_frame_bytes = 1024 * 1024;
        let app = atest::init_service(
            App::new()
                .app_data(web::Data::new(test_state(config)))
                .route("/ws/transcribe", web::get().to(transcribe_websocket)),
        )
        .await;

        let req = atest::TestRequest::get()
            .uri("/ws/transcribe")
            .insert_header((header::UPGRADE, "websocket"))
            .insert_header((header::CONNECTION, "Upgrade"))
            .insert_header((header::SEC_WEBSOCKET_VERSION, "13"))
            .insert_header((header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ=="))
            .to_request();
        let resp = atest::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);
    }
}
