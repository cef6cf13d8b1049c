//! # Streaming Session
//!
//! One `Session` per live connection. It owns the connection's rolling buffer and
//! language preference, turns incoming audio into transcription jobs, and turns
//! finished jobs back into outbound events.
//!
//! ## Session Lifecycle:
//! 1. **Connecting**: created, not yet registered
//! 2. **Active**: registered; the only state that accepts audio and dispatches work
//! 3. **Closing**: being deregistered
//! 4. **Closed**: terminal; late results are dropped
//!
//! ## Locking:
//! The buffer, state and language each sit behind their own lock and are held only
//! for short critical sections. No session lock is ever held while the registry is
//! locked: registration and deregistration happen between state transitions, never
//! inside them.

use crate::audio::buffer::{BufferPolicy, RollingAudioBuffer};
use crate::audio::decoder::AudioDecoder;
use crate::audio::language::{Language, LanguageSet};
use crate::audio::registry::SessionRegistry;
use crate::error::{EngineError, SessionError};
use crate::protocol::ServerEvent;
use crate::transcription::engine::TranscriptionOutput;
use crate::transcription::pool::{TranscriptionJob, TranscriptionOutcome, WindowDispatcher};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared collaborators every session needs. Cheap to clone.
#[derive(Clone)]
pub struct SessionContext {
    pub policy: BufferPolicy,
    pub languages: Arc<LanguageSet>,
    pub decoder: Arc<dyn AudioDecoder>,
    pub dispatcher: Arc<dyn WindowDispatcher>,
}

#[derive(Debug, Default)]
struct SessionCounters {
    chunks_received: AtomicU64,
    bytes_received: AtomicU64,
    decode_errors: AtomicU64,
    windows_dispatched: AtomicU64,
    windows_dropped: AtomicU64,
    transcriptions_emitted: AtomicU64,
    transcription_failures: AtomicU64,
}

/// Per-session activity summary, logged on close.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub state: SessionState,
    pub language: Language,
    pub duration_seconds: f64,
    pub chunks_received: u64,
    pub bytes_received: u64,
    pub chunks_evicted: u64,
    pub decode_errors: u64,
    pub windows_dispatched: u64,
    pub windows_dropped: u64,
    pub transcriptions_emitted: u64,
    pub transcription_failures: u64,
}

/// A single streaming transcription session.
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    state: RwLock<SessionState>,
    language: RwLock<Language>,
    buffer: Mutex<RollingAudioBuffer>,
    next_sequence: AtomicU64,
    context: SessionContext,
    reply: mpsc::UnboundedSender<TranscriptionOutcome>,
    counters: SessionCounters,
}

impl Session {
    /// Create a session in `Connecting` with the configured default language.
    ///
    /// The returned receiver yields this session's transcription outcomes; the
    /// connection that owns the session drains it.
    pub fn new(
        id: impl Into<String>,
        context: SessionContext,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<TranscriptionOutcome>) {
        let (reply, outcomes) = mpsc::unbounded_channel();
        let session = Session {
            id: id.into(),
            created_at: Utc::now(),
            state: RwLock::new(SessionState::Connecting),
            language: RwLock::new(context.languages.default_language()),
            buffer: Mutex::new(RollingAudioBuffer::new(context.policy)),
            next_sequence: AtomicU64::new(0),
            context,
            reply,
            counters: SessionCounters::default(),
        };
        (Arc::new(session), outcomes)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn language(&self) -> Language {
        *self.language.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the session and enter `Active`.
    ///
    /// ## Language Hint:
    /// A missing hint keeps the configured default. An unknown or disabled hint
    /// also keeps the default, and an `error` event describing the rejected hint
    /// follows the `connected` event.
    ///
    /// ## Returns:
    /// - **Ok(events)**: `connected` first, optionally followed by an `error`
    /// - **Err(Capacity)**: the registry is full; the session stays `Connecting`
    /// - **Err(NotActive)**: the session was already connected or closed
    pub fn on_connect(
        self: &Arc<Self>,
        language_hint: Option<&str>,
        registry: &SessionRegistry,
    ) -> Result<Vec<ServerEvent>, SessionError> {
        let state = self.state();
        if state != SessionState::Connecting {
            return Err(SessionError::NotActive(state.to_string()));
        }

        let mut hint_error = None;
        if let Some(hint) = language_hint.filter(|h| !h.trim().is_empty()) {
            match self.context.languages.parse(hint) {
                Ok(language) => {
                    *self.language.write().unwrap_or_else(PoisonError::into_inner) = language;
                }
                Err(e) => {
                    tracing::warn!(session_id = %self.id, hint, "Rejected language hint");
                    hint_error = Some(e);
                }
            }
        }

        registry.register(self.clone())?;
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = SessionState::Active;

        tracing::info!(
            session_id = %self.id,
            language = %self.language(),
            "Session connected"
        );

        let mut events = vec![ServerEvent::connected(
            &self.id,
            self.language(),
            self.context.languages.codes(),
        )];
        if let Some(e) = hint_error {
            events.push(ServerEvent::error(&e));
        }
        Ok(events)
    }

    /// Decode one payload, buffer it and dispatch a window when one is ready.
    ///
    /// Never waits for transcription. Returns the sequence number of the dispatched
    /// window, or `None` when no window was ready or the queue was full.
    pub fn submit_audio(&self, payload: &[u8]) -> Result<Option<u64>, SessionError> {
        self.ensure_active()?;

        self.counters.chunks_received.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_received
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        let samples = self.context.decoder.decode(payload).map_err(|e| {
            self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(session_id = %self.id, "Decode failed: {}", e);
            SessionError::from(e)
        })?;

        // Dispatching under the buffer lock keeps queue order equal to sequence order
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.push(samples);

        let Some(window) = buffer.try_take_window() else {
            return Ok(None);
        };

        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let language = self.language();
        let job = TranscriptionJob {
            session_id: self.id.clone(),
            sequence,
            language,
            samples: window,
            reply: self.reply.clone(),
        };
        let samples = job.samples.len();

        match self.context.dispatcher.dispatch(job) {
            Ok(()) => {
                self.counters.windows_dispatched.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    session_id = %self.id,
                    sequence,
                    language = %language,
                    samples,
                    "Window dispatched"
                );
                Ok(Some(sequence))
            }
            Err(e) => {
                self.counters.windows_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(session_id = %self.id, sequence, "Window dropped: {}", e);
                Ok(None)
            }
        }
    }

    /// Replace the language preference for windows dispatched from now on.
    ///
    /// On failure the previous language is kept.
    pub fn set_language(&self, requested: &str) -> Result<Language, SessionError> {
        self.ensure_active()?;
        let language = self.context.languages.parse(requested)?;

        let previous = {
            let mut current = self.language.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, language)
        };

        tracing::info!(
            session_id = %self.id,
            "Language changed from {} to {}",
            previous,
            language
        );
        Ok(language)
    }

    /// Turn a finished job into an outbound event, if it should produce one.
    ///
    /// Outcomes that arrive after the session left `Active` are dropped.
    pub fn on_transcription_outcome(&self, outcome: TranscriptionOutcome) -> Option<ServerEvent> {
        if !self.is_active() {
            tracing::debug!(
                session_id = %self.id,
                sequence = outcome.sequence,
                "Dropping result for inactive session"
            );
            return None;
        }

        match outcome.result {
            Ok(output) => self.on_transcription_result(&output, outcome.language, outcome.sequence),
            Err(e) => Some(self.on_transcription_failure(&e)),
        }
    }

    /// A `transcription` event for non-empty text; `None` for silence.
    ///
    /// `language` is the snapshot taken when the window was dispatched.
    pub fn on_transcription_result(
        &self,
        output: &TranscriptionOutput,
        language: Language,
        sequence: u64,
    ) -> Option<ServerEvent> {
        let text = output.meaningful_text()?;
        self.counters.transcriptions_emitted.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            session_id = %self.id,
            sequence,
            language = %language,
            "Transcription: {}",
            text
        );

        Some(ServerEvent::transcription(
            &self.id,
            sequence,
            text,
            output.normalized_confidence(),
            language,
        ))
    }

    /// An `error` event for a failed window. The window is not retried.
    pub fn on_transcription_failure(&self, error: &EngineError) -> ServerEvent {
        self.counters
            .transcription_failures
            .fetch_add(1, Ordering::Relaxed);
        tracing::warn!(session_id = %self.id, "Transcription failed: {}", error);
        ServerEvent::error(&SessionError::from(error.clone()))
    }

    /// Leave `Active`, deregister, and enter `Closed`.
    ///
    /// Idempotent: returns false if the session was already closing or closed.
    pub fn close(&self, registry: &SessionRegistry) -> bool {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            match *state {
                SessionState::Closing | SessionState::Closed => return false,
                SessionState::Connecting | SessionState::Active => *state = SessionState::Closing,
            }
        }

        registry.deregister(&self.id);
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = SessionState::Closed;

        let summary = self.summary();
        tracing::info!(
            session_id = %self.id,
            duration_seconds = summary.duration_seconds,
            chunks = summary.chunks_received,
            windows = summary.windows_dispatched,
            dropped = summary.windows_dropped,
            transcriptions = summary.transcriptions_emitted,
            "Session closed"
        );
        true
    }

    pub fn summary(&self) -> SessionSummary {
        let chunks_evicted = self
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .evicted();
        let duration = Utc::now().signed_duration_since(self.created_at);

        SessionSummary {
            session_id: self.id.clone(),
            state: self.state(),
            language: self.language(),
            duration_seconds: duration.num_milliseconds() as f64 / 1000.0,
            chunks_received: self.counters.chunks_received.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            chunks_evicted,
            decode_errors: self.counters.decode_errors.load(Ordering::Relaxed),
            windows_dispatched: self.counters.windows_dispatched.load(Ordering::Relaxed),
            windows_dropped: self.counters.windows_dropped.load(Ordering::Relaxed),
            transcriptions_emitted: self.counters.transcriptions_emitted.load(Ordering::Relaxed),
            transcription_failures: self.counters.transcription_failures.load(Ordering::Relaxed),
        }
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Active => Ok(()),
            other => Err(SessionError::NotActive(other.to_string())),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("language", &self.language())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::decoder::PcmDecoder;
    use crate::transcription::pool::testing::RecordingDispatcher;
    use std::time::Duration;

    pub(crate) fn context(dispatcher: Arc<dyn WindowDispatcher>) -> SessionContext {
        SessionContext {
            policy: BufferPolicy::default(),
            languages: Arc::new(LanguageSet::default()),
            decoder: Arc::new(PcmDecoder::new(16000)),
            dispatcher,
        }
    }

    /// Raw PCM16 payload of `len` samples all equal to `value`.
    pub(crate) fn pcm(value: i16, len: usize) -> Vec<u8> {
        (0..len).flat_map(|_| value.to_le_bytes()).collect()
    }

    fn active_session(
        dispatcher: Arc<RecordingDispatcher>,
        registry: &SessionRegistry,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<TranscriptionOutcome>) {
        let (session, outcomes) = Session::new("s1", context(dispatcher));
        session.on_connect(None, registry).unwrap();
        (session, outcomes)
    }

    fn outcome(job: &TranscriptionJob, text: &str, confidence: Option<f32>) -> TranscriptionOutcome {
        TranscriptionOutcome {
            session_id: job.session_id.clone(),
            sequence: job.sequence,
            language: job.language,
            result: Ok(TranscriptionOutput::new(text, confidence)),
            elapsed: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_connect_registers_and_activates() {
        let registry = SessionRegistry::new(4);
        let (session, _outcomes) = Session::new("s1", context(Arc::new(RecordingDispatcher::new())));
        assert_eq!(session.state(), SessionState::Connecting);

        let events = session.on_connect(Some("yo"), &registry).unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.language(), Language::Yo);
        assert!(registry.contains("s1"));
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ServerEvent::Connected { .. }));
    }

    #[test]
    fn test_bad_language_hint_falls_back_with_error() {
        let registry = SessionRegistry::new(4);
        let (session, _outcomes) = Session::new("s1", context(Arc::new(RecordingDispatcher::new())));

        let events = session.on_connect(Some("xx"), &registry).unwrap();
        assert_eq!(session.language(), Language::Auto);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], ServerEvent::Error { .. }));
    }

    #[test]
    fn test_connect_fails_when_registry_full() {
        let registry = SessionRegistry::new(1);
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let (first, _a) = Session::new("a", context(dispatcher.clone()));
        first.on_connect(None, &registry).unwrap();

        let (second, _b) = Session::new("b", context(dispatcher));
        let err = second.on_connect(None, &registry).unwrap_err();
        assert_eq!(err, SessionError::Capacity(1));
        assert_eq!(second.state(), SessionState::Connecting);
        assert!(second.submit_audio(&pcm(1, 4)).is_err());
    }

    #[test]
    fn test_audio_dispatches_windows_in_sequence() {
        let registry = SessionRegistry::new(4);
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let (session, _outcomes) = active_session(dispatcher.clone(), &registry);

        assert_eq!(session.submit_audio(&pcm(1, 160)).unwrap(), None);
        assert_eq!(session.submit_audio(&pcm(2, 160)).unwrap(), Some(0));
        assert_eq!(session.submit_audio(&pcm(3, 160)).unwrap(), Some(1));
        assert_eq!(session.submit_audio(&pcm(4, 160)).unwrap(), Some(2));

        let jobs = dispatcher.take_jobs();
        let sequences: Vec<u64> = jobs.iter().map(|j| j.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        // Two chunks, then the last three chunks
        assert_eq!(jobs[0].samples.len(), 320);
        assert_eq!(jobs[2].samples.len(), 480);
        assert!(jobs.iter().all(|j| j.session_id == "s1"));
    }

    #[test]
    fn test_decode_error_keeps_session_active() {
        let registry = SessionRegistry::new(4);
        let (session, _outcomes) = active_session(Arc::new(RecordingDispatcher::new()), &registry);

        let err = session.submit_audio(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, SessionError::Decode(_)));
        assert!(!err.is_fatal());
        assert!(session.is_active());
        assert_eq!(session.summary().decode_errors, 1);
    }

    #[test]
    fn test_full_queue_drops_window() {
        let registry = SessionRegistry::new(4);
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let (session, _outcomes) = active_session(dispatcher.clone(), &registry);

        dispatcher.set_full(true);
        session.submit_audio(&pcm(1, 16)).unwrap();
        assert_eq!(session.submit_audio(&pcm(2, 16)).unwrap(), None);
        assert_eq!(session.summary().windows_dropped, 1);

        dispatcher.set_full(false);
        // Sequence numbers are not reused after a drop
        assert_eq!(session.submit_audio(&pcm(3, 16)).unwrap(), Some(1));
    }

    #[test]
    fn test_language_is_snapshotted_at_dispatch() {
        let registry = SessionRegistry::new(4);
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let (session, _outcomes) = active_session(dispatcher.clone(), &registry);

        session.set_language("yo").unwrap();
        session.submit_audio(&pcm(1, 16)).unwrap();
        session.submit_audio(&pcm(2, 16)).unwrap();
        let job = dispatcher.take_jobs().remove(0);

        // Switch before the result comes back
        session.set_language("ha").unwrap();

        let event = session
            .on_transcription_outcome(outcome(&job, "bawo ni", Some(0.8)))
            .unwrap();
        match event {
            ServerEvent::Transcription { language, .. } => assert_eq!(language, Language::Yo),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(session.language(), Language::Ha);
    }

    #[test]
    fn test_unsupported_language_keeps_previous() {
        let registry = SessionRegistry::new(4);
        let (session, _outcomes) = active_session(Arc::new(RecordingDispatcher::new()), &registry);

        session.set_language("ig").unwrap();
        let err = session.set_language("fr").unwrap_err();
        assert_eq!(err, SessionError::UnsupportedLanguage("fr".to_string()));
        assert_eq!(session.language(), Language::Ig);
        assert!(session.is_active());
    }

    #[test]
    fn test_empty_result_emits_nothing() {
        let registry = SessionRegistry::new(4);
        let (session, _outcomes) = active_session(Arc::new(RecordingDispatcher::new()), &registry);

        let empty = TranscriptionOutput::new("  \n\t ", Some(0.9));
        assert!(session.on_transcription_result(&empty, Language::En, 0).is_none());

        let spoken = TranscriptionOutput::new(" hello ", None);
        match session.on_transcription_result(&spoken, Language::En, 1) {
            Some(ServerEvent::Transcription { text, confidence, session_id, sequence, .. }) => {
                assert_eq!(text, "hello");
                assert_eq!(confidence, 0.5);
                assert_eq!(session_id, "s1");
                assert_eq!(sequence, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_failure_emits_error_and_session_stays_active() {
        let registry = SessionRegistry::new(4);
        let (session, _outcomes) = active_session(Arc::new(RecordingDispatcher::new()), &registry);

        let event = session.on_transcription_failure(&EngineError("model crashed".into()));
        match event {
            ServerEvent::Error { message, .. } => {
                assert_eq!(message, "Transcription error: model crashed")
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(session.is_active());
    }

    #[test]
    fn test_out_of_order_results_keep_their_attribution() {
        let registry = SessionRegistry::new(4);
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let (session, _outcomes) = active_session(dispatcher.clone(), &registry);

        session.submit_audio(&pcm(1, 16)).unwrap();
        session.submit_audio(&pcm(2, 16)).unwrap();
        session.set_language("en").unwrap();
        session.submit_audio(&pcm(3, 16)).unwrap();
        let jobs = dispatcher.take_jobs();

        // Complete the later window first
        let later = session.on_transcription_outcome(outcome(&jobs[1], "second", None)).unwrap();
        let earlier = session.on_transcription_outcome(outcome(&jobs[0], "first", None)).unwrap();

        match (later, earlier) {
            (
                ServerEvent::Transcription { sequence: s1, language: l1, text: t1, .. },
                ServerEvent::Transcription { sequence: s0, language: l0, text: t0, .. },
            ) => {
                assert_eq!((s1, l1, t1.as_str()), (1, Language::En, "second"));
                assert_eq!((s0, l0, t0.as_str()), (0, Language::Auto, "first"));
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_close_deregisters_and_drops_late_results() {
        let registry = SessionRegistry::new(4);
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let (session, _outcomes) = active_session(dispatcher.clone(), &registry);

        session.submit_audio(&pcm(1, 16)).unwrap();
        session.submit_audio(&pcm(2, 16)).unwrap();
        let job = dispatcher.take_jobs().remove(0);

        assert!(session.close(&registry));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(registry.get("s1").is_none());
        assert!(!session.close(&registry));

        assert!(session.on_transcription_outcome(outcome(&job, "too late", None)).is_none());
        assert!(matches!(
            session.submit_audio(&pcm(3, 16)),
            Err(SessionError::NotActive(_))
        ));
    }

    #[test]
    fn test_concurrent_sessions_do_not_share_buffers() {
        let registry = SessionRegistry::new(4);
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let (a, _a_out) = Session::new("a", context(dispatcher.clone()));
        let (b, _b_out) = Session::new("b", context(dispatcher.clone()));
        a.on_connect(Some("yo"), &registry).unwrap();
        b.on_connect(Some("ha"), &registry).unwrap();

        let handles: Vec<_> = [(a.clone(), 100i16), (b.clone(), -100i16)]
            .into_iter()
            .map(|(session, value)| {
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        session.submit_audio(&pcm(value, 32)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let jobs = dispatcher.take_jobs();
        assert_eq!(jobs.len(), 38);
        for job in jobs {
            let value: f32 = if job.session_id == "a" { 100.0 } else { -100.0 };
            assert!(job.samples.iter().all(|s| *s == value / 32768.0));
            let language = if job.session_id == "a" { Language::Yo } else { Language::Ha };
            assert_eq!(job.language, language);
        }
    }
}
