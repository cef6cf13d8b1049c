//! # Application State
//!
//! Shared handles every HTTP handler and WebSocket connection needs. `AppState` is
//! cloned into each actix worker, so every field is either immutable or behind an
//! `Arc` with its own synchronization.
//!
//! ## What lives here:
//! - **config**: the validated configuration (read-only after startup)
//! - **metrics**: HTTP request counters, updated by middleware
//! - **registry**: live streaming sessions
//! - **pool**: transcription workers shared by all sessions
//! - **store**: transcript persistence
//! - **session_context**: collaborators handed to every new session
//!
//! ## Locking:
//! `metrics` uses a std `RwLock`. A poisoned lock only means a panic happened while
//! counters were being updated, so the data is still used as-is.

use crate::audio::decoder::PcmDecoder;
use crate::audio::registry::SessionRegistry;
use crate::audio::session::SessionContext;
use crate::config::AppConfig;
use crate::persistence::TranscriptStore;
use crate::transcription::engine::TranscriptionEngine;
use crate::transcription::pool::TranscriptionPool;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub registry: Arc<SessionRegistry>,
    pub engine: Arc<dyn TranscriptionEngine>,
    pub pool: Arc<TranscriptionPool>,
    pub store: Arc<dyn TranscriptStore>,
    pub session_context: SessionContext,
    pub start_time: Instant,
}

/// HTTP metrics collected by `MetricsMiddleware`.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Key: "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Wire up the shared state and start the transcription pool.
    ///
    /// Must be called from within a tokio runtime: the pool spawns its workers here.
    pub fn new(
        config: AppConfig,
        engine: Arc<dyn TranscriptionEngine>,
        store: Arc<dyn TranscriptStore>,
    ) -> Result<Self> {
        let languages = Arc::new(config.languages.language_set()?);
        let pool = Arc::new(TranscriptionPool::start(
            engine.clone(),
            store.clone(),
            config.engine.workers,
            config.engine.queue_capacity,
        ));

        let session_context = SessionContext {
            policy: config.audio.buffer_policy(),
            languages,
            decoder: Arc::new(PcmDecoder::new(config.audio.sample_rate)),
            dispatcher: pool.clone(),
        };

        Ok(Self {
            registry: Arc::new(SessionRegistry::new(
                config.performance.max_concurrent_sessions,
            )),
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            engine,
            pool,
            store,
            session_context,
            start_time: Instant::now(),
        })
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.error_count += 1;
    }

    /// Record one finished request for `endpoint`.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Copy of the metrics, so no lock is held while a response is built.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Number of live streaming sessions.
    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
