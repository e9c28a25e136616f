//! Session lifecycle HTTP handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::errors::{AppError, AppResult};
use crate::sessions::{ControlCommand, InterruptSource, SessionConfig};
use crate::state::AppState;

/// How long a minted session id is advertised as valid. Advisory only;
/// nothing expires server-side.
const SESSION_TTL_MINUTES: i64 = 30;

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "wsPath")]
    pub ws_path: String,
    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,
}

/// `POST /session` - mint a session id ahead of the WebSocket attach.
///
/// The body is an optional session config; any field outside the documented
/// set, or an out-of-range value, is a 400.
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    payload: Option<Json<serde_json::Value>>,
) -> AppResult<Json<CreateSessionResponse>> {
    let config: SessionConfig = match payload {
        Some(Json(value)) => serde_json::from_value(value)
            .map_err(|e| AppError::Validation(format!("invalid session config: {e}")))?,
        None => SessionConfig::default(),
    };
    config.validate().map_err(AppError::Validation)?;

    let session_id = uuid::Uuid::new_v4().to_string();
    state.registry.get_or_create(&session_id, config.clone());
    if let Err(e) = state.journal.append(
        &session_id,
        "session_opened",
        json!({ "source": "api", "config": config }),
    ) {
        warn!(session_id, error = %e, "journal append failed");
    }

    Ok(Json(CreateSessionResponse {
        ws_path: format!("/ws?sessionId={session_id}"),
        expires_at: Utc::now() + Duration::minutes(SESSION_TTL_MINUTES),
        session_id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct InterruptRequest {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct InterruptResponse {
    pub ok: bool,
    pub interrupted: bool,
}

/// `POST /interrupt` - out-of-band interruption of a running session.
///
/// The command is delivered into the session's relay lane, which performs
/// the upstream restart, journals it and notifies the browser.
pub async fn interrupt_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InterruptRequest>,
) -> Json<InterruptResponse> {
    let interrupted = match state.registry.get(&request.session_id) {
        Some(session) if session.upstream_started().await => {
            match session.control_sender().await {
                Some(control) => control
                    .send(ControlCommand::Interrupt {
                        source: InterruptSource::Api,
                    })
                    .await
                    .is_ok(),
                None => false,
            }
        }
        _ => false,
    };

    Json(InterruptResponse {
        ok: true,
        interrupted,
    })
}

/// `GET /history` - session summaries, newest first.
pub async fn history_list(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({ "sessions": state.journal.list() }))
}

/// `GET /history/{id}` - the full event log of one session.
pub async fn history_detail(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let events = state.journal.events(&session_id);
    if events.is_empty() {
        return Err(AppError::NotFound("session_not_found"));
    }
    Ok(Json(json!({ "sessionId": session_id, "events": events })))
}

/// `GET /health`
pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "now": Utc::now().to_rfc3339() }))
}
