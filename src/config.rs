//! # Configuration Management
//!
//! Application configuration is assembled from several sources:
//! - Default values (built into the code)
//! - An optional `config.toml` (or any format the `config` crate understands) in
//!   the working directory
//! - Environment variables with the `APP__` prefix, `__` separating sections
//!   (e.g. `APP__ENGINE__WORKERS=4`)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. `APP__*` environment variables
//! 3. Configuration file
//! 4. Defaults

use crate::audio::buffer::BufferPolicy;
use crate::audio::language::LanguageSet;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub languages: LanguagesConfig,
    pub engine: EngineConfig,
    pub performance: PerformanceConfig,
    pub persistence: PersistenceConfig,
}

/// HTTP/WebSocket server settings.
///
/// ## Fields:
/// - `host`/`port`: bind address
/// - `heartbeat_interval_secs`: how often the server pings each WebSocket client
/// - `client_timeout_secs`: connections silent for longer than this are closed
/// - `max_frame_bytes`: largest WebSocket frame accepted; base64 `audio_chunk`
///   messages are about 4/3 the size of the audio they carry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub max_frame_bytes: usize,
}

/// Audio intake and windowing.
///
/// ## Windowing:
/// Each received payload is one chunk. Once `min_chunks` chunks are buffered,
/// every new chunk produces a window made of the last `window_chunks` chunks.
/// At most `max_chunks` are retained; older chunks are evicted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub max_chunks: usize,
    pub min_chunks: usize,
    pub window_chunks: usize,
}

impl AudioConfig {
    pub fn buffer_policy(&self) -> BufferPolicy {
        BufferPolicy {
            max_chunks: self.max_chunks,
            min_chunks: self.min_chunks,
            window_chunks: self.window_chunks,
        }
    }
}

/// Languages clients may select, and the default for new sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguagesConfig {
    pub supported: Vec<String>,
    pub default: String,
}

impl LanguagesConfig {
    pub fn language_set(&self) -> Result<LanguageSet> {
        LanguageSet::from_codes(&self.supported, &self.default)
    }
}

/// Transcription engine and worker pool.
///
/// ## Fields:
/// - `model`: Whisper size ("tiny", "base", "small", "medium", "large")
/// - `device`: "auto", "cpu", "cuda" or "metal"
/// - `workers`: maximum concurrent engine calls
/// - `queue_capacity`: windows waiting beyond this are dropped
/// - `max_tokens`: decoding limit per window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub model: String,
    pub device: String,
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

/// Where transcripts are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    Memory,
    Jsonl,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub backend: PersistenceBackend,
    /// File used by the `jsonl` backend
    pub path: String,
    /// Records kept per session (memory) and returned per history request
    pub history_limit: usize,
    /// Sessions kept by the memory backend before the least recently written
    /// one is dropped
    pub max_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8000,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
                max_frame_bytes: 8 * 1024 * 1024,
            },
            audio: AudioConfig {
                sample_rate: 16000,
                max_chunks: 10,
                min_chunks: 2,
                window_chunks: 3,
            },
            languages: LanguagesConfig {
                supported: ["auto", "en", "yo", "ig", "ha"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                default: "auto".to_string(),
            },
            engine: EngineConfig {
                model: "small".to_string(),
                device: "auto".to_string(),
                workers: 2,
                queue_capacity: 32,
                max_tokens: 224,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 100,
            },
            persistence: PersistenceConfig {
                backend: PersistenceBackend::Memory,
                path: "transcripts.jsonl".to_string(),
                history_limit: 500,
                max_sessions: 1000,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.*` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__PORT=9000`
    /// - `APP__ENGINE__MODEL=tiny`
    /// - `APP__PERSISTENCE__BACKEND=jsonl`
    /// - `HOST=0.0.0.0`, `PORT=3000`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("languages.supported")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.heartbeat_interval_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }

        if self.server.client_timeout_secs <= self.server.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than the heartbeat interval"
            ));
        }

        if self.server.max_frame_bytes < 64 * 1024 {
            return Err(anyhow::anyhow!("server.max_frame_bytes must be at least 65536"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rate must be greater than 0"));
        }

        if self.audio.min_chunks == 0 {
            return Err(anyhow::anyhow!("audio.min_chunks must be greater than 0"));
        }

        if self.audio.window_chunks == 0 {
            return Err(anyhow::anyhow!("audio.window_chunks must be greater than 0"));
        }

        if self.audio.max_chunks < self.audio.min_chunks {
            return Err(anyhow::anyhow!(
                "audio.max_chunks ({}) must be at least audio.min_chunks ({})",
                self.audio.max_chunks,
                self.audio.min_chunks
            ));
        }

        if self.audio.max_chunks < self.audio.window_chunks {
            return Err(anyhow::anyhow!(
                "audio.max_chunks ({}) must be at least audio.window_chunks ({})",
                self.audio.max_chunks,
                self.audio.window_chunks
            ));
        }

        if self.engine.workers == 0 {
            return Err(anyhow::anyhow!("engine.workers must be greater than 0"));
        }

        if self.engine.queue_capacity == 0 {
            return Err(anyhow::anyhow!("engine.queue_capacity must be greater than 0"));
        }

        if self.engine.max_tokens == 0 {
            return Err(anyhow::anyhow!("engine.max_tokens must be greater than 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.persistence.history_limit == 0 {
            return Err(anyhow::anyhow!("persistence.history_limit must be greater than 0"));
        }

        if self.persistence.max_sessions == 0 {
            return Err(anyhow::anyhow!("persistence.max_sessions must be greater than 0"));
        }

        self.languages.language_set()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::language::Language;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.max_frame_bytes, 8 * 1024 * 1024);
        assert_eq!(config.audio.buffer_policy(), BufferPolicy::default());
        assert_eq!(config.persistence.backend, PersistenceBackend::Memory);
        assert!(config.validate().is_ok());

        let languages = config.languages.language_set().unwrap();
        assert_eq!(languages.default_language(), Language::Auto);
        assert_eq!(languages.codes(), vec!["auto", "en", "yo", "ig", "ha"]);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.min_chunks = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.max_chunks = 2;
        config.audio.window_chunks = 3;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.engine.workers = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.languages.supported = vec!["en".to_string(), "xx".to_string()];
        config.languages.default = "en".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.languages.default = "fr".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.server.client_timeout_secs = config.server.heartbeat_interval_secs;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.server.max_frame_bytes = 1024;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.persistence.max_sessions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_layered_sources_deserialize() {
        let config: AppConfig = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default()).unwrap())
            .add_source(config::File::from_str(
                "[server]\nmax_frame_bytes = 1048576\n\n[engine]\nworkers = 6\n\n[persistence]\nbackend = \"jsonl\"\nmax_sessions = 50\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.engine.workers, 6);
        assert_eq!(config.engine.model, "small");
        assert_eq!(config.persistence.backend, PersistenceBackend::Jsonl);
        assert_eq!(config.persistence.max_sessions, 50);
        assert_eq!(config.server.max_frame_bytes, 1024 * 1024);
    }
}
