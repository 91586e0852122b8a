use tracing::info;
use tracing_subscriber::EnvFilter;

use eduwallet_backend::config::AppConfig;
use eduwallet_backend::{create_router, initialize_backend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG takes precedence; log records from the library are captured too
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::load()?;
    info!("Using data directory {}", config.data_directory.display());

    let bind_address = config.bind_address.clone();
    let allowed_origin = config.allowed_origin.clone();
    let app_state = initialize_backend(config).await?;
    let app = create_router(app_state, &allowed_origin)?;

    info!("Starting server on {}", bind_address);
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
