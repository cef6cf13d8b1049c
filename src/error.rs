//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - **AppError**: failures of the HTTP surface (health, config, history), converted
//!   into JSON error responses through actix's `ResponseError`.
//! - **SessionError**: failures inside one streaming session. None of them is
//!   process-fatal; all but `Transport` and `Capacity` leave the session Active and
//!   are reported to the client as an `error` event.
//!
//! The collaborator errors (`DecodeError`, `EngineError`) are small message-carrying
//! types so that decoder and engine implementations stay independent of the session
//! layer.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned by HTTP handlers.
///
/// ## Status Mapping:
/// - Internal/ConfigError → 500
/// - BadRequest → 400
/// - NotFound → 404
/// - Unavailable → 503
#[derive(Debug)]
pub enum AppError {
    /// Server-side failure (store I/O, serialization)
    Internal(String),

    /// Client sent invalid data
    BadRequest(String),

    /// Requested resource does not exist
    NotFound(String),

    /// Configuration file or environment problems
    ConfigError(String),

    /// A collaborator the request depends on is disabled or not ready
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// The audio payload could not be decoded into PCM samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError(pub String);

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for DecodeError {}

/// The transcription engine failed on one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError(pub String);

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for EngineError {}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError(format!("{:#}", err))
    }
}

/// Failures scoped to a single streaming session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Malformed or unsupported audio payload (per chunk)
    Decode(String),

    /// Malformed control message
    Parse(String),

    /// Requested language is not in the supported set; the prior setting is kept
    UnsupportedLanguage(String),

    /// Transcription of one window failed; the window is discarded
    Engine(String),

    /// The connection itself failed
    Transport(String),

    /// Operation attempted while the session is not Active
    NotActive(String),

    /// The registry refused a new session
    Capacity(usize),
}

impl SessionError {
    /// Whether this error ends the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Transport(_) | SessionError::Capacity(_))
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Decode(msg) => write!(f, "Audio processing error: {}", msg),
            SessionError::Parse(msg) => write!(f, "Invalid message: {}", msg),
            SessionError::UnsupportedLanguage(lang) => write!(f, "Unsupported language: {}", lang),
            SessionError::Engine(msg) => write!(f, "Transcription error: {}", msg),
            SessionError::Transport(msg) => write!(f, "Connection error: {}", msg),
            SessionError::NotActive(state) => write!(f, "Session is not active (state: {})", state),
            SessionError::Capacity(max) => {
                write!(f, "Maximum concurrent sessions ({}) reached", max)
            }
        }
    }
}

impl std::error::Error for SessionError {}

impl From<DecodeError> for SessionError {
    fn from(err: DecodeError) -> Self {
        SessionError::Decode(err.0)
    }
}

impl From<EngineError> for SessionError {
    fn from(err: EngineError) -> Self {
        SessionError::Engine(err.0)
    }
}
