//! # Streaming Protocol
//!
//! Wire messages exchanged over the transcription WebSocket and the
//! transport-agnostic handler that maps them onto session operations.
//!
//! ## Inbound (client → server):
//! - `{"type": "audio_chunk", "data": "<base64>"}`
//! - `{"type": "change_language", "language": "yo"}`
//! - `{"type": "ping"}`
//! - raw binary frames, treated as audio payloads
//!
//! ## Outbound (server → client):
//! `connected`, `transcription`, `language_changed`, `error`, `pong`, each a JSON
//! object discriminated by `type`.
//!
//! Every inbound message produces at most one event. Nothing here ever waits for
//! transcription: results arrive later through `handle_outcome`.

use crate::audio::language::Language;
use crate::audio::registry::SessionRegistry;
use crate::audio::session::{Session, SessionContext};
use crate::error::SessionError;
use crate::transcription::pool::TranscriptionOutcome;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Current time as fractional unix seconds.
pub fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Structured control messages from the client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    AudioChunk { data: String },
    ChangeLanguage { language: String },
    Ping,
}

/// Events sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        session_id: String,
        message: String,
        language: Language,
        supported_languages: Vec<String>,
        timestamp: f64,
    },
    Transcription {
        text: String,
        confidence: f32,
        language: Language,
        session_id: String,
        sequence: u64,
        timestamp: f64,
    },
    LanguageChanged {
        language: Language,
        session_id: String,
        timestamp: f64,
    },
    Error {
        message: String,
        timestamp: f64,
    },
    Pong {
        timestamp: f64,
    },
}

impl ServerEvent {
    pub fn connected(session_id: &str, language: Language, supported: Vec<&'static str>) -> Self {
        ServerEvent::Connected {
            session_id: session_id.to_string(),
            message: "Connected to transcription service".to_string(),
            language,
            supported_languages: supported.into_iter().map(str::to_string).collect(),
            timestamp: unix_timestamp(),
        }
    }

    pub fn transcription(
        session_id: &str,
        sequence: u64,
        text: &str,
        confidence: f32,
        language: Language,
    ) -> Self {
        ServerEvent::Transcription {
            text: text.to_string(),
            confidence,
            language,
            session_id: session_id.to_string(),
            sequence,
            timestamp: unix_timestamp(),
        }
    }

    pub fn language_changed(session_id: &str, language: Language) -> Self {
        ServerEvent::LanguageChanged {
            language,
            session_id: session_id.to_string(),
            timestamp: unix_timestamp(),
        }
    }

    pub fn error(error: &SessionError) -> Self {
        ServerEvent::Error {
            message: error.to_string(),
            timestamp: unix_timestamp(),
        }
    }

    pub fn pong() -> Self {
        ServerEvent::Pong {
            timestamp: unix_timestamp(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Parse a text frame into a control message.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, SessionError> {
    serde_json::from_str(text).map_err(|e| SessionError::Parse(e.to_string()))
}

/// Binds one session to one connection.
///
/// The owning connection feeds it inbound frames and the outcomes drained from
/// the session's reply channel, and writes whatever events come back. Because
/// all outbound events pass through the connection's own context, there is a
/// single writer per connection.
pub struct ProtocolHandler {
    session: Arc<Session>,
    registry: Arc<SessionRegistry>,
}

impl ProtocolHandler {
    /// Create, register and activate a new session.
    ///
    /// ## Returns:
    /// - the handler
    /// - the session's outcome receiver, to be drained by the connection
    /// - the opening events (`connected`, maybe followed by an `error` for a bad hint)
    pub fn connect(
        session_id: impl Into<String>,
        context: SessionContext,
        registry: Arc<SessionRegistry>,
        language_hint: Option<&str>,
    ) -> Result<
        (
            Self,
            mpsc::UnboundedReceiver<TranscriptionOutcome>,
            Vec<ServerEvent>,
        ),
        SessionError,
    > {
        let (session, outcomes) = Session::new(session_id, context);
        let events = session.on_connect(language_hint, &registry)?;
        Ok((Self { session, registry }, outcomes, events))
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    /// Handle a text frame.
    pub fn handle_text(&self, text: &str) -> Option<ServerEvent> {
        let message = match parse_client_message(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(session_id = %self.session_id(), "Malformed message: {}", e);
                return Some(ServerEvent::error(&e));
            }
        };

        match message {
            ClientMessage::Ping => Some(ServerEvent::pong()),
            ClientMessage::ChangeLanguage { language } => {
                match self.session.set_language(&language) {
                    Ok(language) => Some(ServerEvent::language_changed(self.session_id(), language)),
                    Err(e) => Some(ServerEvent::error(&e)),
                }
            }
            ClientMessage::AudioChunk { data } => match STANDARD.decode(data.trim()) {
                Ok(payload) => self.submit(&payload),
                Err(e) => Some(ServerEvent::error(&SessionError::Parse(format!(
                    "audio_chunk data is not valid base64: {}",
                    e
                )))),
            },
        }
    }

    /// Handle a binary frame as a raw audio payload.
    pub fn handle_binary(&self, payload: &[u8]) -> Option<ServerEvent> {
        self.submit(payload)
    }

    /// Handle a finished transcription job.
    ///
    /// The registry lookup by session id decides whether the result is still
    /// deliverable; results for sessions that have been closed are dropped.
    pub fn handle_outcome(&self, outcome: TranscriptionOutcome) -> Option<ServerEvent> {
        match self.registry.get(&outcome.session_id) {
            Some(session) => session.on_transcription_outcome(outcome),
            None => {
                tracing::debug!(
                    session_id = %outcome.session_id,
                    sequence = outcome.sequence,
                    "Dropping result for unknown session"
                );
                None
            }
        }
    }

    /// Close the session. Safe to call more than once.
    pub fn disconnect(&self) -> bool {
        self.session.close(&self.registry)
    }

    fn submit(&self, payload: &[u8]) -> Option<ServerEvent> {
        match self.session.submit_audio(payload) {
            Ok(_) => None,
            Err(e) => Some(ServerEvent::error(&e)),
        }
    }
}
