use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Most recent records to return, capped at `persistence.history_limit`
    pub limit: Option<usize>,
}

/// `GET /api/v1/transcription-history/{session_id}`
///
/// Returns `{session_id, count, transcriptions}` with records oldest first. A
/// session without stored records yields an empty list, not a 404: sessions are
/// gone from the registry once they close but their transcripts remain.
pub async fn get_transcription_history(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    if session_id.trim().is_empty() {
        return Err(AppError::BadRequest("session_id must not be empty".to_string()));
    }

    if !state.store.is_enabled() {
        return Err(AppError::Unavailable(
            "transcript persistence is disabled".to_string(),
        ));
    }

    let max = state.config.persistence.history_limit;
    let limit = query.limit.unwrap_or(max).clamp(1, max);

    let store = state.store.clone();
    let id = session_id.clone();
    let transcriptions = web::block(move || store.history(&id, limit))
        .await
        .map_err(|e| AppError::Internal(format!("history lookup was cancelled: {}", e)))??;

    tracing::debug!(
        session_id = %session_id,
        count = transcriptions.len(),
        "Served transcription history"
    );

    Ok(HttpResponse::Ok().json(json!({
        "session_id": session_id,
        "count": transcriptions.len(),
        "transcriptions": transcriptions,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::language::Language;
    use crate::config::{AppConfig, PersistenceBackend};
    use crate::persistence::{build_store, MemoryStore, TranscriptRecord};
    use crate::state::testing::test_state;
    use crate::transcription::engine::testing::ScriptedEngine;
    use actix_web::{test, App};
    use std::sync::Arc;

    fn record(session_id: &str, sequence: u64) -> TranscriptRecord {
        TranscriptRecord {
            session_id: session_id.to_string(),
            sequence,
            text: format!("line {}", sequence),
            confidence: 0.8,
            language: Language::En,
            timestamp: 1_700_000_000.0 + sequence as f64,
        }
    }

    macro_rules! history_app {
        ($state:expr) => {
            test::init_service(App::new().app_data(web::Data::new($state)).route(
                "/api/v1/transcription-history/{session_id}",
                web::get().to(get_transcription_history),
            ))
            .await
        };
    }

    #[actix_web::test]
    async fn test_history_returns_session_records_in_order() {
        let state = test_state(AppConfig::default());
        for sequence in 0..3 {
            state.store.append(&record("abc", sequence)).unwrap();
        }
        state.store.append(&record("other", 0)).unwrap();

        let app = history_app!(state);

        let req = test::TestRequest::get()
            .uri("/api/v1/transcription-history/abc")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["session_id"], "abc");
        assert_eq!(body["count"], 3);
        let items = body["transcriptions"].as_array().unwrap();
        assert_eq!(items[0]["sequence"], 0);
        assert_eq!(items[2]["text"], "line 2");
        assert_eq!(items[2]["language"], "en");

        let req = test::TestRequest::get()
            .uri("/api/v1/transcription-history/abc?limit=1")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["transcriptions"][0]["sequence"], 2);
    }

    #[actix_web::test]
    async fn test_unknown_session_has_empty_history() {
        let app = history_app!(test_state(AppConfig::default()));

        let req = test::TestRequest::get()
            .uri("/api/v1/transcription-history/nobody")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["count"], 0);
        assert_eq!(body["transcriptions"], json!([]));
    }

    #[actix_web::test]
    async fn test_disabled_store_is_unavailable() {
        let mut config = AppConfig::default();
        config.persistence.backend = PersistenceBackend::None;
        let store = build_store(&config.persistence).unwrap();
        let state = AppState::new(config, Arc::new(ScriptedEngine::new()), store).unwrap();

        let app = history_app!(state);
        let req = test::TestRequest::get()
            .uri("/api/v1/transcription-history/abc")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 503);
    }

    #[actix_web::test]
    async fn test_limit_is_capped_by_configuration() {
        let mut config = AppConfig::default();
        config.persistence.history_limit = 2;
        let state = AppState::new(
            config,
            Arc::new(ScriptedEngine::new()),
            Arc::new(MemoryStore::new(10)),
        )
        .unwrap();
        for sequence in 0..5 {
            state.store.append(&record("abc", sequence)).unwrap();
        }

        let app = history_app!(state);
        let req = test::TestRequest::get()
            .uri("/api/v1/transcription-history/abc?limit=50")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["count"], 2);
        assert_eq!(body["transcriptions"][0]["sequence"], 3);
    }
}
