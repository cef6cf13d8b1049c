//! # Transcript Persistence
//!
//! Every non-empty transcription result is written to a transcript store by the
//! worker that produced it, whether or not the originating session is still open.
//! Writes are fire-and-forget: a failing store is logged and never surfaces to the
//! client or blocks delivery of the live `transcription` event.
//!
//! ## Backends:
//! - **memory**: bounded per-session history held in process (default); once
//!   `max_sessions` sessions are held, the least recently written one is dropped
//! - **jsonl**: one JSON record per line, appended to a file
//! - **none**: persistence disabled; history lookups are unavailable

use crate::audio::language::Language;
use crate::config::{PersistenceBackend, PersistenceConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

/// One persisted transcription result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptRecord {
    pub session_id: String,
    pub sequence: u64,
    pub text: String,
    pub confidence: f32,
    pub language: Language,
    /// Unix seconds at which the result was produced
    pub timestamp: f64,
}

/// Storage for transcript records.
///
/// Implementations are called from blocking worker threads and must be safe to
/// share between them.
pub trait TranscriptStore: Send + Sync {
    /// Append one record.
    fn append(&self, record: &TranscriptRecord) -> Result<()>;

    /// The most recent `limit` records of a session, oldest first.
    fn history(&self, session_id: &str, limit: usize) -> Result<Vec<TranscriptRecord>>;

    /// Backend name reported by health and config endpoints.
    fn backend(&self) -> &'static str;

    /// False when the backend discards everything.
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Build the store selected by configuration.
pub fn build_store(config: &PersistenceConfig) -> Result<Arc<dyn TranscriptStore>> {
    let store: Arc<dyn TranscriptStore> = match config.backend {
        PersistenceBackend::Memory => Arc::new(
            MemoryStore::new(config.history_limit).with_max_sessions(config.max_sessions),
        ),
        PersistenceBackend::Jsonl => Arc::new(JsonlStore::open(&config.path)?),
        PersistenceBackend::None => Arc::new(DisabledStore),
    };

    tracing::info!("Transcript persistence backend: {}", store.backend());
    Ok(store)
}

/// Sessions held by a [`MemoryStore`] unless configured otherwise.
pub const DEFAULT_MAX_SESSIONS: usize = 1000;

#[derive(Default)]
struct SessionHistory {
    records: VecDeque<TranscriptRecord>,
    /// Value of `MemoryTables::writes` at the last append
    last_write: u64,
}

#[derive(Default)]
struct MemoryTables {
    sessions: HashMap<String, SessionHistory>,
    writes: u64,
}

/// In-process store keeping at most `per_session_limit` records per session and
/// at most `max_sessions` sessions.
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
    per_session_limit: usize,
    max_sessions: usize,
}

impl MemoryStore {
    pub fn new(per_session_limit: usize) -> Self {
        Self {
            tables: Mutex::new(MemoryTables::default()),
            per_session_limit: per_session_limit.max(1),
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions.max(1);
        self
    }

    pub fn session_count(&self) -> usize {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sessions
            .len()
    }
}

impl TranscriptStore for MemoryStore {
    fn append(&self, record: &TranscriptRecord) -> Result<()> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        tables.writes += 1;
        let write = tables.writes;

        if !tables.sessions.contains_key(&record.session_id)
            && tables.sessions.len() >= self.max_sessions
        {
            let stale = tables
                .sessions
                .iter()
                .min_by_key(|(_, history)| history.last_write)
                .map(|(session_id, _)| session_id.clone());
            if let Some(stale) = stale {
                tables.sessions.remove(&stale);
                tracing::debug!(session_id = %stale, "Evicted transcript history");
            }
        }

        let history = tables.sessions.entry(record.session_id.clone()).or_default();
        history.last_write = write;
        history.records.push_back(record.clone());
        while history.records.len() > self.per_session_limit {
            history.records.pop_front();
        }
        Ok(())
    }

    fn history(&self, session_id: &str, limit: usize) -> Result<Vec<TranscriptRecord>> {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(tables
            .sessions
            .get(session_id)
            .map(|history| {
                let skip = history.records.len().saturating_sub(limit);
                history.records.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Append-only JSON-lines file.
pub struct JsonlStore {
    path: PathBuf,
    /// Serializes appends so lines from concurrent workers never interleave
    write_lock: Mutex<()>,
}

impl JsonlStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        // Touch the file so a bad path fails at startup rather than on first result
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open transcript file {}", path.display()))?;

        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }
}

impl TranscriptStore for JsonlStore {
    fn append(&self, record: &TranscriptRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open transcript file {}", self.path.display()))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn history(&self, session_id: &str, limit: usize) -> Result<Vec<TranscriptRecord>> {
        let file = {
            let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            OpenOptions::new()
                .read(true)
                .open(&self.path)
                .with_context(|| format!("Failed to read transcript file {}", self.path.display()))?
        };

        let mut matches = VecDeque::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TranscriptRecord>(&line) {
                Ok(record) if record.session_id == session_id => {
                    matches.push_back(record);
                    if matches.len() > limit {
                        matches.pop_front();
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Skipping unreadable transcript line: {}", e),
            }
        }

        Ok(matches.into_iter().collect())
    }

    fn backend(&self) -> &'static str {
        "jsonl"
    }
}

/// Discards every record.
pub struct DisabledStore;

impl TranscriptStore for DisabledStore {
    fn append(&self, _record: &TranscriptRecord) -> Result<()> {
        Ok(())
    }

    fn history(&self, _session_id: &str, _limit: usize) -> Result<Vec<TranscriptRecord>> {
        Ok(Vec::new())
    }

    fn backend(&self) -> &'static str {
        "none"
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(session_id: &str, sequence: u64, text: &str) -> TranscriptRecord {
        TranscriptRecord {
            session_id: session_id.to_string(),
            sequence,
            text: text.to_string(),
            confidence: 0.8,
            language: Language::En,
            timestamp: 1_700_000_000.0 + sequence as f64,
        }
    }

    #[test]
    fn test_memory_store_is_per_session_and_bounded() {
        let store = MemoryStore::new(3);
        for i in 0..5 {
            store.append(&record("a", i, "hello")).unwrap();
        }
        store.append(&record("b", 0, "other")).unwrap();

        let history = store.history("a", 10).unwrap();
        let sequences: Vec<u64> = history.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![2, 3, 4]);

        assert_eq!(store.history("b", 10).unwrap().len(), 1);
        assert!(store.history("missing", 10).unwrap().is_empty());
    }

    #[test]
    fn test_memory_store_history_limit_keeps_latest() {
        let store = MemoryStore::new(100);
        for i in 0..5 {
            store.append(&record("a", i, "x")).unwrap();
        }

        let history = store.history("a", 2).unwrap();
        assert_eq!(history, vec![record("a", 3, "x"), record("a", 4, "x")]);
    }

    #[test]
    fn test_memory_store_evicts_least_recently_written_session() {
        let store = MemoryStore::new(10).with_max_sessions(3);
        store.append(&record("a", 0, "first")).unwrap();
        store.append(&record("b", 0, "second")).unwrap();
        store.append(&record("c", 0, "third")).unwrap();
        // "a" is written again, so "b" becomes the stalest
        store.append(&record("a", 1, "again")).unwrap();

        for i in 0..20 {
            store.append(&record(&format!("extra-{}", i), 0, "x")).unwrap();
            assert!(store.session_count() <= 3);
        }

        assert_eq!(store.session_count(), 3);
        assert!(store.history("b", 10).unwrap().is_empty());
        assert!(store.history("extra-19", 10).unwrap().len() == 1);
        assert!(store.history("extra-0", 10).unwrap().is_empty());
    }

    #[test]
    fn test_memory_store_keeps_recently_written_session() {
        let store = MemoryStore::new(10).with_max_sessions(2);
        store.append(&record("live", 0, "one")).unwrap();
        for i in 0..5 {
            store.append(&record(&format!("short-{}", i), 0, "x")).unwrap();
            store.append(&record("live", i + 1, "more")).unwrap();
        }

        assert_eq!(store.session_count(), 2);
        assert_eq!(store.history("live", 10).unwrap().len(), 6);
        assert_eq!(store.history("short-4", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_build_store_applies_session_cap() {
        let config = PersistenceConfig {
            backend: PersistenceBackend::Memory,
            path: String::new(),
            history_limit: 5,
            max_sessions: 2,
        };
        let store = build_store(&config).unwrap();
        for session in ["a", "b", "c"] {
            store.append(&record(session, 0, "x")).unwrap();
        }
        assert!(store.history("a", 10).unwrap().is_empty());
        assert_eq!(store.history("c", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_jsonl_store_appends_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("transcripts.jsonl");
        let store = JsonlStore::open(&path).unwrap();

        store.append(&record("a", 0, "first")).unwrap();
        store.append(&record("b", 0, "elsewhere")).unwrap();
        store.append(&record("a", 1, "second")).unwrap();

        let history = store.history("a", 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text, "first");
        assert_eq!(history[1].text, "second");

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);
    }

    #[test]
    fn test_jsonl_store_skips_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcripts.jsonl");
        std::fs::write(&path, "not json\n\n").unwrap();

        let store = JsonlStore::open(&path).unwrap();
        store.append(&record("a", 7, "ok")).unwrap();

        let history = store.history("a", 10).unwrap();
        assert_eq!(history, vec![record("a", 7, "ok")]);
    }

    #[test]
    fn test_disabled_store() {
        let store = DisabledStore;
        store.append(&record("a", 0, "x")).unwrap();
        assert!(store.history("a", 10).unwrap().is_empty());
        assert!(!store.is_enabled());
        assert_eq!(store.backend(), "none");
    }
}
