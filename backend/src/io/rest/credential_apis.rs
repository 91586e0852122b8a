//! # REST API for QR Credentials
//!
//! Issue, inspect and act on a child's QR identity credential, and fetch
//! its rendering.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use log::{error, info, warn};
use serde::Deserialize;
use shared::{CredentialAction, IssueCredentialRequest, QrRenderResponse};

use super::mappers::credential_mapper::CredentialMapper;
use super::{actor_from_headers, error_status};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RenderQuery {
    pub grid_size: Option<usize>,
    pub canvas_px: Option<u32>,
}

fn failure(context: &str, e: anyhow::Error) -> axum::response::Response {
    let status = error_status(&e);
    if status.is_server_error() {
        error!("{}: {}", context, e);
    } else {
        warn!("{}: {}", context, e);
    }
    (status, e.to_string()).into_response()
}

/// Issue (or re-issue) a child's credential
pub async fn issue_credential(
    State(state): State<AppState>,
    Path(child_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<IssueCredentialRequest>,
) -> impl IntoResponse {
    info!("POST /api/children/{}/qr - request: {:?}", child_id, request);

    let actor = actor_from_headers(&headers, &state.config.audit);
    match state
        .credential_service
        .issue(&child_id, request.mode, request.rotation_interval_minutes, &actor)
        .await
    {
        Ok(view) => (
            StatusCode::CREATED,
            Json(CredentialMapper::to_response_dto(view.credential, view.payload)),
        )
            .into_response(),
        Err(e) => failure("Failed to issue QR credential", e),
    }
}

/// Current credential and payload; the payload is what the copy button exports
pub async fn get_credential(
    State(state): State<AppState>,
    Path(child_id): Path<String>,
) -> impl IntoResponse {
    info!("GET /api/children/{}/qr", child_id);

    match state.credential_service.get(&child_id).await {
        Ok(Some(view)) => (
            StatusCode::OK,
            Json(CredentialMapper::to_response_dto(view.credential, view.payload)),
        )
            .into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "QR credential not found").into_response(),
        Err(e) => failure("Failed to get QR credential", e),
    }
}

/// Rotate, enable or disable
pub async fn apply_action(
    State(state): State<AppState>,
    Path(child_id): Path<String>,
    headers: HeaderMap,
    Json(action): Json<CredentialAction>,
) -> impl IntoResponse {
    info!("POST /api/children/{}/qr/actions - action: {:?}", child_id, action);

    let actor = actor_from_headers(&headers, &state.config.audit);
    match state.credential_service.apply_action(&child_id, action, &actor).await {
        Ok(view) => (
            StatusCode::OK,
            Json(CredentialMapper::to_response_dto(view.credential, view.payload)),
        )
            .into_response(),
        Err(e) => failure("QR credential action failed", e),
    }
}

/// Grid cells for the current payload
pub async fn render_credential(
    State(state): State<AppState>,
    Path(child_id): Path<String>,
    Query(query): Query<RenderQuery>,
) -> impl IntoResponse {
    info!("GET /api/children/{}/qr/render - query: {:?}", child_id, query);

    let grid_size = query.grid_size.unwrap_or(state.config.qr.grid_size);
    let canvas_px = query.canvas_px.unwrap_or(state.config.qr.canvas_px);
    match state.credential_service.render(&child_id, grid_size, canvas_px).await {
        Ok((qr, payload)) => {
            let response = QrRenderResponse {
                payload,
                grid_size: qr.grid_size,
                canvas_px: qr.canvas_px,
                cell_px: qr.cell_px,
                cells: qr.cells,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => failure("Failed to render QR credential", e),
    }
}

/// The rendering as an SVG image
pub async fn render_credential_svg(
    State(state): State<AppState>,
    Path(child_id): Path<String>,
) -> impl IntoResponse {
    info!("GET /api/children/{}/qr/svg", child_id);

    match state
        .credential_service
        .render(&child_id, state.config.qr.grid_size, state.config.qr.canvas_px)
        .await
    {
        Ok((qr, _)) => (StatusCode::OK, [(header::CONTENT_TYPE, "image/svg+xml")], qr.to_svg()).into_response(),
        Err(e) => failure("Failed to render QR credential", e),
    }
}
