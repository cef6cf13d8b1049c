//! # Realtime Transcriber - Main Application Entry Point
//!
//! Streaming speech-to-text server. Clients open a WebSocket, push audio chunks and
//! receive transcription events for overlapping windows of the most recent audio.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, `APP__*` environment)
//! - **audio**: rolling buffers, decoding, languages, sessions and the session registry
//! - **protocol**: wire messages and the transport-agnostic `ProtocolHandler`
//! - **transcription**: engine trait, Whisper backend and the bounded worker pool
//! - **persistence**: transcript storage behind `TranscriptStore`
//! - **websocket**: actix actor binding a connection to one session
//! - **health / handlers / middleware**: the HTTP surface
//!
//! ## Startup Order:
//! 1. `.env`, tracing, configuration
//! 2. device selection and Whisper model load (downloads on first run)
//! 3. transcript store and worker pool
//! 4. HTTP server, until SIGINT/SIGTERM

mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod middleware;
mod persistence;
mod protocol;
mod state;
mod transcription;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use config::AppConfig;
use state::AppState;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::whisper::{ModelSize, WhisperEngine};

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load().context("Failed to load configuration")?;
    config.validate()?;

    info!("Starting realtime-transcriber v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{} (model: {}, workers: {}, max sessions: {})",
        config.server.host,
        config.server.port,
        config.engine.model,
        config.engine.workers,
        config.performance.max_concurrent_sessions
    );

    let device = device::device_from_config(&config.engine.device);
    let model_size: ModelSize = config.engine.model.parse()?;
    let engine = WhisperEngine::load(model_size, device, config.engine.max_tokens)
        .await
        .context("Failed to load the Whisper model")?;

    let store = persistence::build_store(&config.persistence)?;
    let app_state = AppState::new(config.clone(), Arc::new(engine), store)?;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(
                middleware::RequestLogging::new()
                    .quiet("/health")
                    .quiet("/api/health")
                    .quiet("/api/v1/health"),
            )
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route(
                        "/transcription-history/{session_id}",
                        web::get().to(handlers::get_transcription_history),
                    ),
            )
            .route("/api/health", web::get().to(health::health_check))
            .route("/health", web::get().to(health::health_check))
            .route(
                "/ws/transcribe",
                web::get().to(websocket::transcribe_websocket),
            )
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls filtering; defaults to
/// `realtime_transcriber=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "realtime_transcriber=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("Failed to initialize tracing")?;

    Ok(())
}

/// Resolves on SIGINT (Ctrl+C) or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
