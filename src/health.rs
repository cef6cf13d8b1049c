//! # Health and Metrics Endpoints
//!
//! - `GET /health`, `/api/health`, `/api/v1/health`: liveness plus a summary of
//!   the streaming service (active connections, engine readiness, queue depth)
//! - `GET /api/v1/metrics`: per-endpoint HTTP counters and transcription pool stats

use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let model_loaded = state.engine.is_ready();
    let active_connections = state.active_connections();

    HttpResponse::Ok().json(json!({
        "status": if model_loaded { "healthy" } else { "degraded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
        "active_connections": active_connections,
        "model_loaded": model_loaded,
        "engine": state.pool.engine_name(),
        "supported_languages": state.session_context.languages.codes(),
        "transcription": state.pool.stats(),
        "persistence": {
            "backend": state.store.backend(),
            "enabled": state.store.is_enabled(),
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": overall_error_rate(&metrics),
        },
        "memory": get_memory_info(),
        "system": get_system_status(active_connections, state.registry.max_sessions()),
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": overall_error_rate(&metrics),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "sessions": {
            "active": state.active_connections(),
            "max": state.registry.max_sessions(),
        },
        "transcription": state.pool.stats(),
        "memory": get_memory_info(),
    }))
}

fn overall_error_rate(metrics: &AppMetrics) -> f64 {
    if metrics.request_count > 0 {
        metrics.error_count as f64 / metrics.request_count as f64
    } else {
        0.0
    }
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", process::id())) {
            let read_kb = |prefix: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(prefix))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": read_kb("VmRSS:"),
                "virtual_memory_bytes": read_kb("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "pid": process::id()
    })
}

fn get_system_status(active_sessions: usize, max_sessions: usize) -> serde_json::Value {
    let session_usage = if max_sessions > 0 {
        active_sessions as f64 / max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": max_sessions,
        "current_sessions": active_sessions,
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::session::Session;
    use crate::config::AppConfig;
    use crate::state::testing::test_state;
    use actix_web::{test as atest, App};

    #[actix_web::test]
    async fn test_health_reports_service_state() {
        let state = test_state(AppConfig::default());
        let (session, _outcomes) = Session::new("s-1".to_string(), state.session_context.clone());
        state.registry.register(session).unwrap();

        let app = atest::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/health", web::get().to(health_check))
                .route("/api/health", web::get().to(health_check)),
        )
        .await;

        for path in ["/health", "/api/health"] {
            let req = atest::TestRequest::get().uri(path).to_request();
            let body: serde_json::Value = atest::call_and_read_body_json(&app, req).await;

            assert_eq!(body["status"], "healthy");
            assert_eq!(body["active_connections"], 1);
            assert_eq!(body["model_loaded"], true);
            assert_eq!(body["engine"], "scripted");
            assert_eq!(body["transcription"]["workers"], 2);
            assert_eq!(body["persistence"]["backend"], "memory");
        }
    }

    #[actix_web::test]
    async fn test_metrics_lists_endpoints() {
        let state = test_state(AppConfig::default());
        state.record_endpoint_request("GET /health", 4, false);
        state.record_endpoint_request("GET /api/v1/config", 2, true);

        let app = atest::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/api/v1/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = atest::TestRequest::get().uri("/api/v1/metrics").to_request();
        let body: serde_json::Value = atest::call_and_read_body_json(&app, req).await;

        let endpoints = body["endpoints"].as_array().unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0]["endpoint"], "GET /api/v1/config");
        assert_eq!(endpoints[0]["error_rate"], 1.0);
        assert_eq!(body["sessions"]["max"], 100);
        assert_eq!(body["transcription"]["submitted"], 0);
    }

    #[test]
    fn test_system_status_thresholds() {
        assert_eq!(get_system_status(1, 10)["status"], "normal");
        assert_eq!(get_system_status(8, 10)["status"], "moderate_load");
        assert_eq!(get_system_status(10, 10)["status"], "high_load");
        assert_eq!(get_system_status(0, 0)["session_usage_percent"], 0.0);
    }
}
