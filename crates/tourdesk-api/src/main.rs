mod auth;
mod config;
mod error;
mod routes;

use std::sync::Arc;

use config::AppConfig;
use routes::{app_router, AppState};
use tourdesk_core::db::Database;
use tourdesk_core::sheets::GoogleSheetsClient;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tourdesk_api=info".parse()?)
                .add_directive("tourdesk_core=info".parse()?),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting tourdesk-api with config: {:?}", config);

    let db = Arc::new(Database::open(&config.engine.database_path).await?);
    let sheets = Arc::new(GoogleSheetsClient::new(config.sheets.clone())?);

    let state = AppState::new(config, db, sheets);
    let bind_addr = state.config.bind_addr.clone();
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("tourdesk-api listening on {}", bind_addr);
    axum::serve(listener, router).await?;
    Ok(())
}
