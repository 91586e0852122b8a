//! # REST API for the Linking Wizard
//!
//! A client starts a session, posts one event per user action and renders the
//! returned session view. The response to the final `next` carries the
//! completion instead of a view.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use log::{error, info, warn};
use shared::{DemoCodesResponse, WizardEventRequest};

use super::mappers::session_mapper::SessionMapper;
use super::{actor_from_headers, error_status};
use crate::domain::code_validator::DEMO_CODES;
use crate::AppState;

/// Start a new session
pub async fn start_session(State(state): State<AppState>) -> impl IntoResponse {
    info!("POST /api/linking/sessions");

    let (session_id, session) = state.linking_service.start_session();
    (StatusCode::CREATED, Json(SessionMapper::to_view(&session_id, &session))).into_response()
}

/// Get the current state of a session
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    info!("GET /api/linking/sessions/{}", session_id);

    match state.linking_service.get_session(&session_id).await {
        Ok(session) => (StatusCode::OK, Json(SessionMapper::to_view(&session_id, &session))).into_response(),
        Err(e) => {
            warn!("Failed to get linking session: {}", e);
            (error_status(&e), e.to_string()).into_response()
        }
    }
}

/// Cancel a session without writing anything
pub async fn cancel_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    info!("DELETE /api/linking/sessions/{}", session_id);

    match state.linking_service.cancel_session(&session_id) {
        Ok(()) => (StatusCode::NO_CONTENT, "").into_response(),
        Err(e) => (error_status(&e), e.to_string()).into_response(),
    }
}

/// Apply one wizard event
pub async fn post_event(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<WizardEventRequest>,
) -> impl IntoResponse {
    info!("POST /api/linking/sessions/{}/events - request: {:?}", session_id, request);

    let event = match SessionMapper::to_event(request) {
        Ok(event) => event,
        Err(e) => {
            warn!("Rejected wizard event: {:#}", e);
            return (StatusCode::BAD_REQUEST, format!("{:#}", e)).into_response();
        }
    };

    let actor = actor_from_headers(&headers, &state.config.audit);
    match state.linking_service.apply_event(&session_id, event, &actor).await {
        Ok(result) => (StatusCode::OK, Json(SessionMapper::to_event_response(&session_id, result))).into_response(),
        Err(e) => {
            let status = error_status(&e);
            if status.is_server_error() {
                error!("Failed to apply wizard event: {}", e);
            } else {
                warn!("Wizard event rejected: {}", e);
            }
            (status, e.to_string()).into_response()
        }
    }
}

/// Codes offered by the demo scanner
pub async fn get_demo_codes() -> impl IntoResponse {
    info!("GET /api/linking/demo-codes");

    let response = DemoCodesResponse {
        codes: DEMO_CODES.iter().map(|c| c.to_string()).collect(),
    };
    (StatusCode::OK, Json(response)).into_response()
}
