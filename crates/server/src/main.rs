//! Server binary: API plus janitor.

use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use wharf_auth::{TokenEngine, auth_driver_from_config};
use wharf_core::Configuration;
use wharf_metadata::{MetadataStore, SqliteStore};
use wharf_server::scanner::{HttpScanner, VulnerabilityScanner};
use wharf_server::{AppState, Janitor, create_router};
use wharf_storage::storage_driver_from_config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("WHARF_CONFIG").ok())
        .ok_or("usage: wharf-server <config.json> (or set WHARF_CONFIG)")?;
    let config: Configuration = serde_json::from_str(&std::fs::read_to_string(&config_path)?)?;

    let db: Arc<dyn MetadataStore> = Arc::new(SqliteStore::new(&config.database_path).await?);
    let storage = storage_driver_from_config(&config.storage)?;
    let auth_driver = auth_driver_from_config(&config.auth)?;
    let token_engine = TokenEngine::new(&config)?;
    let scanner: Option<Arc<dyn VulnerabilityScanner>> = config
        .scanner_url
        .as_deref()
        .map(|url| Arc::new(HttpScanner::new(url)) as Arc<dyn VulnerabilityScanner>);

    let state = AppState::new(
        config.clone(),
        db.clone(),
        storage.clone(),
        auth_driver,
        token_engine,
        scanner.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let janitor = Arc::new(Janitor::new(
        state.config.clone(),
        db,
        storage,
        scanner,
    ));
    let janitor_handle = tokio::spawn(janitor.run(shutdown_rx));

    let listener = tokio::net::TcpListener::bind(&config.listen_address).await?;
    tracing::info!(address = %config.listen_address, "listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    // stop the janitor between items, never mid-item
    let _ = shutdown_tx.send(true);
    let _ = janitor_handle.await;
    Ok(())
}
