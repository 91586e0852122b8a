//! # REST API for the Audit Log

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use log::{error, info};
use serde::Deserialize;

use super::mappers::audit_mapper::AuditMapper;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<u32>,
}

/// Most recent audit events first
pub async fn list_audit_events(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> impl IntoResponse {
    info!("GET /api/audit - limit: {:?}", query.limit);

    match state.audit_log.recent_events(query.limit).await {
        Ok(events) => (StatusCode::OK, Json(AuditMapper::to_log_dto(events))).into_response(),
        Err(e) => {
            error!("Failed to read audit log: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Error reading audit log").into_response()
        }
    }
}
