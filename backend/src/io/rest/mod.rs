//! # REST API Interface Layer
//!
//! HTTP endpoints for the linking wizard, children and QR credentials.
//! This layer handles:
//! - JSON request/response translation through [`mappers`]
//! - Caller identity from the `X-Guardian-Id` and `X-Device` headers
//! - Translating domain errors into HTTP status codes
//!
//! Handlers hold no business rules; they call a service and map the result.

pub mod audit_apis;
pub mod child_apis;
pub mod credential_apis;
pub mod linking_apis;
pub mod mappers;

use axum::http::{HeaderMap, StatusCode};

use crate::config::AuditConfig;
use crate::domain::credential_service::CredentialServiceError;
use crate::domain::linking_service::LinkingError;
use crate::domain::models::ActorContext;
use crate::domain::pseudo_qr::RenderError;
use crate::domain::qr_credential::CredentialError;

pub const GUARDIAN_HEADER: &str = "x-guardian-id";
pub const DEVICE_HEADER: &str = "x-device";

/// Who is calling, falling back to the configured defaults
pub fn actor_from_headers(headers: &HeaderMap, defaults: &AuditConfig) -> ActorContext {
    let header = |name: &str, fallback: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(fallback)
            .to_string()
    };
    ActorContext::new(
        header(GUARDIAN_HEADER, &defaults.default_actor),
        header(DEVICE_HEADER, &defaults.default_device),
    )
}

/// Pick the status code for a failed service call
pub fn error_status(error: &anyhow::Error) -> StatusCode {
    if let Some(e) = error.downcast_ref::<CredentialError>() {
        return match e {
            CredentialError::NotRotatable { .. } => StatusCode::CONFLICT,
            CredentialError::InvalidConfiguration(_) => StatusCode::BAD_REQUEST,
            CredentialError::TokenNotFresh => StatusCode::INTERNAL_SERVER_ERROR,
        };
    }
    if let Some(e) = error.downcast_ref::<LinkingError>() {
        return match e {
            LinkingError::SessionNotFound(_) | LinkingError::ExistingChildNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            LinkingError::SessionClosed(_) => StatusCode::CONFLICT,
            LinkingError::UnknownRosterCode(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
    }
    if error.downcast_ref::<CredentialServiceError>().is_some() {
        return StatusCode::NOT_FOUND;
    }
    if error.downcast_ref::<RenderError>().is_some() {
        return StatusCode::BAD_REQUEST;
    }
    StatusCode::INTERNAL_SERVER_ERROR
}
