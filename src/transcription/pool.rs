//! # Transcription Worker Pool
//!
//! A fixed set of workers pulls windows from one bounded queue shared by every
//! session. Each job carries its session's reply channel, so results flow back to
//! the connection that produced the window without any global routing table.
//!
//! ## Behaviour:
//! - **Non-blocking intake**: `dispatch` never waits; a full queue rejects the job
//! - **Bounded parallelism**: at most `workers` engine calls run at once
//! - **No ordering promise**: results of one session may complete out of order;
//!   every outcome carries the sequence number assigned at dispatch
//! - **Reply first**: the outcome is sent to the session before its transcript is
//!   written, so a slow store never delays the live event
//! - **Late results**: if the session is gone the reply channel is closed and the
//!   outcome is dropped; the transcript is still persisted

use crate::audio::language::Language;
use crate::error::EngineError;
use crate::persistence::{TranscriptRecord, TranscriptStore};
use crate::transcription::engine::{TranscriptionEngine, TranscriptionOutput};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

/// One window queued for transcription.
#[derive(Debug)]
pub struct TranscriptionJob {
    pub session_id: String,
    pub sequence: u64,
    /// Language snapshot taken when the window was dispatched
    pub language: Language,
    pub samples: Vec<f32>,
    pub reply: mpsc::UnboundedSender<TranscriptionOutcome>,
}

/// A finished job, delivered on the session's reply channel.
#[derive(Debug, Clone)]
pub struct TranscriptionOutcome {
    pub session_id: String,
    pub sequence: u64,
    pub language: Language,
    pub result: Result<TranscriptionOutput, EngineError>,
    pub elapsed: Duration,
}

/// Why a window could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    QueueFull,
    Closed,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::QueueFull => f.write_str("transcription queue is full"),
            DispatchError::Closed => f.write_str("transcription pool is shut down"),
        }
    }
}

/// Where sessions send ready windows.
pub trait WindowDispatcher: Send + Sync {
    /// Queue a job without waiting.
    fn dispatch(&self, job: TranscriptionJob) -> Result<(), DispatchError>;
}

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicU64,
    total_processing_ms: AtomicU64,
}

/// Point-in-time view of the pool for health and metrics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub queue_capacity: usize,
    pub queued: usize,
    pub in_flight: u64,
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
    pub average_processing_ms: u64,
}

/// Bounded pool of transcription workers.
pub struct TranscriptionPool {
    sender: mpsc::Sender<TranscriptionJob>,
    counters: Arc<PoolCounters>,
    workers: usize,
    queue_capacity: usize,
    engine_name: String,
}

impl TranscriptionPool {
    /// Spawn `workers` worker tasks on the current tokio runtime.
    ///
    /// ## Parameters:
    /// - **engine**: shared by all workers; each call runs on a blocking thread
    /// - **store**: receives every non-empty result
    /// - **workers**: parallelism bound (raised to at least one)
    /// - **queue_capacity**: pending windows beyond this are rejected
    pub fn start(
        engine: Arc<dyn TranscriptionEngine>,
        store: Arc<dyn TranscriptStore>,
        workers: usize,
        queue_capacity: usize,
    ) -> Self {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (sender, receiver) = mpsc::channel(queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let counters = Arc::new(PoolCounters::default());
        let engine_name = engine.name();

        for worker_id in 0..workers {
            tokio::spawn(run_worker(
                worker_id,
                receiver.clone(),
                engine.clone(),
                store.clone(),
                counters.clone(),
            ));
        }

        tracing::info!(
            "Transcription pool started: {} workers, queue capacity {}, engine {}",
            workers,
            queue_capacity,
            engine_name
        );

        Self {
            sender,
            counters,
            workers,
            queue_capacity,
            engine_name,
        }
    }

    pub fn engine_name(&self) -> &str {
        &self.engine_name
    }

    pub fn stats(&self) -> PoolStats {
        let completed = self.counters.completed.load(Ordering::Relaxed);
        let failed = self.counters.failed.load(Ordering::Relaxed);
        let finished = completed + failed;

        PoolStats {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            queued: self.queue_capacity.saturating_sub(self.sender.capacity()),
            in_flight: self.counters.in_flight.load(Ordering::Relaxed),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            completed,
            failed,
            average_processing_ms: if finished > 0 {
                self.counters.total_processing_ms.load(Ordering::Relaxed) / finished
            } else {
                0
            },
        }
    }
}

impl WindowDispatcher for TranscriptionPool {
    fn dispatch(&self, job: TranscriptionJob) -> Result<(), DispatchError> {
        match self.sender.try_send(job) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Transcription queue full, dropping window {} of session {}",
                    job.sequence,
                    job.session_id
                );
                Err(DispatchError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    "Transcription pool closed, dropping window {} of session {}",
                    job.sequence,
                    job.session_id
                );
                Err(DispatchError::Closed)
            }
        }
    }
}

async fn run_worker(
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<TranscriptionJob>>>,
    engine: Arc<dyn TranscriptionEngine>,
    store: Arc<dyn TranscriptStore>,
    counters: Arc<PoolCounters>,
) {
    tracing::debug!("Transcription worker {} started", worker_id);

    loop {
        // Hold the receiver lock only while waiting for the next job
        let job = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };
        let Some(job) = job else { break };

        counters.in_flight.fetch_add(1, Ordering::Relaxed);
        let (outcome, reply) = process_job(job, engine.clone()).await;
        counters.in_flight.fetch_sub(1, Ordering::Relaxed);

        counters
            .total_processing_ms
            .fetch_add(outcome.elapsed.as_millis() as u64, Ordering::Relaxed);
        match &outcome.result {
            Ok(_) => counters.completed.fetch_add(1, Ordering::Relaxed),
            Err(_) => counters.failed.fetch_add(1, Ordering::Relaxed),
        };

        let record = transcript_record(&outcome);

        if let Err(rejected) = reply.send(outcome) {
            tracing::debug!(
                "Session {} is gone, dropping result {}",
                rejected.0.session_id,
                rejected.0.sequence
            );
        }

        if let Some(record) = record {
            persist(store.clone(), record).await;
        }
    }

    tracing::debug!("Transcription worker {} stopped", worker_id);
}

/// The record to store for an outcome; `None` for failures and empty text.
fn transcript_record(outcome: &TranscriptionOutcome) -> Option<TranscriptRecord> {
    let output = outcome.result.as_ref().ok()?;
    let text = output.meaningful_text()?;
    Some(TranscriptRecord {
        session_id: outcome.session_id.clone(),
        sequence: outcome.sequence,
        text: text.to_string(),
        confidence: output.normalized_confidence(),
        language: outcome.language,
        timestamp: crate::protocol::unix_timestamp(),
    })
}

/// Store I/O runs on a blocking thread. Failures are logged only.
async fn persist(store: Arc<dyn TranscriptStore>, record: TranscriptRecord) {
    let sequence = record.sequence;
    let session_id = record.session_id.clone();
    match tokio::task::spawn_blocking(move || store.append(&record)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(
            "Failed to persist transcript {} of session {}: {:#}",
            sequence,
            session_id,
            e
        ),
        Err(e) => tracing::warn!(
            "Persistence task for transcript {} of session {} failed: {}",
            sequence,
            session_id,
            e
        ),
    }
}

/// Run the engine on a blocking thread.
async fn process_job(
    job: TranscriptionJob,
    engine: Arc<dyn TranscriptionEngine>,
) -> (TranscriptionOutcome, mpsc::UnboundedSender<TranscriptionOutcome>) {
    let TranscriptionJob {
        session_id,
        sequence,
        language,
        samples,
        reply,
    } = job;

    let started = Instant::now();

    let result = tokio::task::spawn_blocking(move || engine.transcribe(&samples, language.engine_hint()))
    .await
    .unwrap_or_else(|e| Err(EngineError(format!("Transcription task failed: {}", e))));

    let elapsed = started.elapsed();
    match &result {
        Ok(output) => tracing::debug!(
            "Window {} of session {} transcribed in {}ms ({} chars)",
            sequence,
            session_id,
            elapsed.as_millis(),
            output.text.len()
        ),
        Err(e) => tracing::warn!(
            "Window {} of session {} failed after {}ms: {}",
            sequence,
            session_id,
            elapsed.as_millis(),
            e
        ),
    }

    (
        TranscriptionOutcome {
            session_id,
            sequence,
            language,
            result,
            elapsed,
        },
        reply,
    )
}
