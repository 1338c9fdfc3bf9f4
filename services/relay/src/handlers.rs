//! Chunked-HTTP transport: discrete request/response calls driving the same
//! session core as the socket transport. State lives entirely in the session
//! registry between calls; each `stream` call forwards one chunk of PCM and
//! polls for any completed turn, which comes back as an `audio/wav` body.

use crate::{
    session::{orchestrator::StartError, registry::DEFAULT_INPUT_MIME, turn::Terminal},
    state::AppState,
    ws::protocol::ServerMessage,
};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Failed {
        error: String,
        details: Option<String>,
    },
    Internal(anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(error) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error,
                    details: None,
                },
            ),
            ApiError::NotFound(error) => (
                StatusCode::NOT_FOUND,
                ErrorBody {
                    error,
                    details: None,
                },
            ),
            ApiError::Failed { error, details } => {
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorBody { error, details })
            }
            ApiError::Internal(err) => {
                error!("internal error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        error: "internal server error".to_string(),
                        details: None,
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

impl From<StartError> for ApiError {
    fn from(err: StartError) -> Self {
        let (error, details) = err.describe();
        ApiError::Failed {
            error: error.to_string(),
            details,
        }
    }
}

#[derive(Deserialize)]
pub struct VoiceQuery {
    action: String,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

#[derive(Serialize)]
struct StartAck {
    success: bool,
    #[serde(rename = "sessionId")]
    session_id: String,
}

#[derive(Serialize)]
struct StreamAck {
    success: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    events: Vec<ServerMessage>,
}

/// Dispatches `POST /voice?action=start|stream|end&sessionId=...`.
pub async fn voice_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VoiceQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let session_id = query
        .session_id
        .ok_or_else(|| ApiError::BadRequest("sessionId query parameter is required".to_string()))?;

    match query.action.as_str() {
        "start" => start_session(&state, &session_id).await,
        "stream" => stream_audio(&state, &session_id, &headers, &body).await,
        "end" => end_session(&state, &session_id).await,
        other => Err(ApiError::BadRequest(format!("invalid action `{other}`"))),
    }
}

async fn start_session(state: &Arc<AppState>, session_id: &str) -> Result<Response, ApiError> {
    let session = state.orchestrator.start(session_id, None, None).await?;
    // No transport close to observe in this mode; the watchdog is the only
    // thing standing between an abandoned client and a leaked session.
    state.orchestrator.attach_watchdog(&session, None);
    Ok(Json(StartAck {
        success: true,
        session_id: session_id.to_string(),
    })
    .into_response())
}

async fn stream_audio(
    state: &Arc<AppState>,
    session_id: &str,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response, ApiError> {
    if state.registry.get(session_id).is_none() {
        return Err(ApiError::NotFound(format!("session `{session_id}` not found")));
    }

    let mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or(DEFAULT_INPUT_MIME);
    state
        .orchestrator
        .forward_audio(session_id, body, Some(mime), None)
        .await;

    let drained = state.orchestrator.poll(session_id).await.unwrap_or_default();
    if let Some(Terminal::Error(message)) = drained.terminal {
        return Err(ApiError::Failed {
            error: "upstream connection error".to_string(),
            details: Some(message),
        });
    }
    if let Some(wav) = drained.wav {
        return Ok(wav_response(wav));
    }
    Ok(Json(StreamAck {
        success: true,
        events: drained.events.into_iter().map(Into::into).collect(),
    })
    .into_response())
}

async fn end_session(state: &Arc<AppState>, session_id: &str) -> Result<Response, ApiError> {
    match state.orchestrator.end(session_id).await {
        None => Err(ApiError::NotFound(format!("session `{session_id}` not found"))),
        Some(drained) => {
            if let Some(wav) = drained.wav {
                Ok(wav_response(wav))
            } else {
                Ok(Json(serde_json::json!({"success": true})).into_response())
            }
        }
    }
}

fn wav_response(wav: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "audio/wav")], wav).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::time::Duration;

    fn app_state(api_key: Option<&str>) -> Arc<AppState> {
        Arc::new(AppState::new(Arc::new(Config {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            gemini_api_key: api_key.map(str::to_string),
            live_model: "models/gemini-2.0-flash-live-001".to_string(),
            voice_name: "Zephyr".to_string(),
            idle_timeout: None,
            final_turn_timeout: Duration::from_millis(50),
            log_level: tracing::Level::INFO,
        })))
    }

    async fn call(
        state: Arc<AppState>,
        action: &str,
        session_id: Option<&str>,
    ) -> Result<Response, ApiError> {
        let query = VoiceQuery {
            action: action.to_string(),
            session_id: session_id.map(str::to_string),
        };
        voice_handler(
            State(state),
            Query(query),
            HeaderMap::new(),
            Bytes::new(),
        )
        .await
    }

    #[tokio::test]
    async fn missing_session_id_is_a_bad_request() {
        let result = call(app_state(Some("key")), "start", None).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn unknown_action_is_a_bad_request() {
        let result = call(app_state(Some("key")), "bogus", Some("s1")).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn start_without_api_key_reports_configuration_error() {
        let result = call(app_state(None), "start", Some("s1")).await;
        match result {
            Err(ApiError::Failed { error, details }) => {
                assert_eq!(error, "API key not configured");
                assert!(details.is_some());
            }
            other => panic!("expected Failed, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn stream_to_unknown_session_is_not_found() {
        let result = call(app_state(Some("key")), "stream", Some("ghost")).await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn end_of_unknown_session_is_not_found() {
        let result = call(app_state(Some("key")), "end", Some("ghost")).await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[test]
    fn api_error_maps_to_expected_status_codes() {
        assert_eq!(
            ApiError::BadRequest("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::NotFound("x".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Failed {
                error: "x".into(),
                details: None
            }
            .into_response()
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::Internal(anyhow::anyhow!("boom"))
                .into_response()
                .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn wav_response_carries_the_audio_content_type() {
        let response = wav_response(vec![0u8; 44]);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "audio/wav"
        );
    }
}
