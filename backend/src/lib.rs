//! # EduWallet Backend
//!
//! Server side of the "Add a child" flow and the child QR identity credential.
//!
//! ## Architecture
//!
//! ```text
//! IO Layer (REST API, mappers)
//!     ↓
//! Domain Layer (wizard state machine, credential lifecycle, renderer)
//!     ↓
//! Storage Layer (YAML documents and CSV files in the data directory)
//! ```
//!
//! [`initialize_backend`] wires the services together and [`create_router`]
//! exposes them over HTTP.

pub mod config;
pub mod domain;
pub mod io;
pub mod storage;

use anyhow::{Context, Result};
use axum::{
    http::{HeaderValue, Method},
    routing::{get, post},
    Router,
};
use log::info;
use shared::QrMode;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use config::AppConfig;
use domain::linking_service::AutoIssue;
use domain::qr_credential::{OsTokenGenerator, QrCredentialManager, TokenGenerator};
use domain::{CredentialService, LinkingService};
use io::rest::{audit_apis, child_apis, credential_apis, linking_apis};
use storage::csv::{ChildRepository, CredentialRepository, CsvAuditLog, CsvConnection, CsvRosterDirectory};
use storage::traits::{AuditSink, ChildStorage};

/// Application state shared by all handlers
#[derive(Clone)]
pub struct AppState {
    pub linking_service: LinkingService,
    pub credential_service: CredentialService,
    pub children: Arc<dyn ChildStorage>,
    pub audit_log: Arc<dyn AuditSink>,
    pub config: Arc<AppConfig>,
}

/// Initialize the backend with all required services
pub async fn initialize_backend(config: AppConfig) -> Result<AppState> {
    initialize_backend_with_tokens(config, Arc::new(OsTokenGenerator)).await
}

/// Same as [`initialize_backend`] with a caller-supplied token source
pub async fn initialize_backend_with_tokens(
    config: AppConfig,
    tokens: Arc<dyn TokenGenerator>,
) -> Result<AppState> {
    info!("Setting up storage in {}", config.data_directory.display());
    let connection = CsvConnection::new(&config.data_directory)?;
    let children: Arc<dyn ChildStorage> = Arc::new(ChildRepository::new(connection.clone()));
    let audit_log: Arc<dyn AuditSink> = Arc::new(CsvAuditLog::new(connection.clone()));

    info!("Setting up domain model");
    let credential_service = CredentialService::new(
        QrCredentialManager::new(tokens, config.qr.scheme.clone()),
        children.clone(),
        Arc::new(CredentialRepository::new(connection.clone())),
        audit_log.clone(),
    );
    let mut linking_service = LinkingService::new(
        children.clone(),
        Arc::new(CsvRosterDirectory::new(connection)),
        audit_log.clone(),
        credential_service.clone(),
    );
    if config.qr.issue_on_link {
        let rotation_interval_minutes = match config.qr.default_mode {
            QrMode::Dynamic => Some(config.qr.default_rotation_minutes),
            QrMode::Static => None,
        };
        info!("New children get a {:?} QR credential on link", config.qr.default_mode);
        linking_service = linking_service.with_auto_issue(AutoIssue {
            mode: config.qr.default_mode,
            rotation_interval_minutes,
        });
    }

    info!("Setting up application state");
    Ok(AppState {
        linking_service,
        credential_service,
        children,
        audit_log,
        config: Arc::new(config),
    })
}

/// Create the Axum router with all routes configured
pub fn create_router(app_state: AppState, allowed_origin: &str) -> Result<Router> {
    let origin = allowed_origin
        .parse::<HeaderValue>()
        .with_context(|| format!("Invalid allowed origin: {}", allowed_origin))?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/linking/sessions", post(linking_apis::start_session))
        .route(
            "/linking/sessions/:id",
            get(linking_apis::get_session).delete(linking_apis::cancel_session),
        )
        .route("/linking/sessions/:id/events", post(linking_apis::post_event))
        .route("/linking/demo-codes", get(linking_apis::get_demo_codes))
        .route("/children", get(child_apis::list_children))
        .route("/children/:id", get(child_apis::get_child))
        .route(
            "/children/:id/qr",
            get(credential_apis::get_credential).post(credential_apis::issue_credential),
        )
        .route("/children/:id/qr/actions", post(credential_apis::apply_action))
        .route("/children/:id/qr/render", get(credential_apis::render_credential))
        .route("/children/:id/qr/svg", get(credential_apis::render_credential_svg))
        .route("/audit", get(audit_apis::list_audit_events));

    Ok(Router::new()
        .nest("/api", api_routes)
        .layer(cors)
        .with_state(app_state))
}
