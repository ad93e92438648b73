pub mod api;
pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod store;

// Export API types
pub use api::handlers;
pub use api::routes;

pub use error::{EngineError, EngineResult, ErrorKind};

// Export logic types
pub use logic::{EngineOptions, NewRepository, ObjectStat, RefType, ResolvedRef, VersionEngine};

// Export all model types
pub use model::*;

// Export store types
pub use store::{open_store, KvError, MemoryStore, PostgresStore, Store};

/// Build the HTTP application over an engine
pub fn build_app(engine: std::sync::Arc<VersionEngine>) -> axum::Router {
    crate::api::routes::create_router().with_state(engine)
}

/// Load configuration, open the configured KV backend and serve the API
pub async fn run_server() -> anyhow::Result<()> {
    use axum::serve;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    // Initialize logging with explicit filter to suppress sqlx debug logs
    let _ = env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .filter_module("sqlx", log::LevelFilter::Warn)
        .parse_default_env()
        .try_init();

    // Load configuration
    let config = crate::config::AppConfig::load()?;
    log::info!(
        "configuration loaded: server={}, kv backend={:?}",
        config.server_address(),
        config.kv.backend
    );

    // Backend provisioning failures are fatal here
    let store = open_store(&config).await?;
    let engine = Arc::new(VersionEngine::new(
        store.clone(),
        EngineOptions::from(&config.engine),
    ));

    let bind_address = config.server_address();
    let listener = TcpListener::bind(&bind_address).await?;
    log::info!("lakeref listening on http://{}", bind_address);

    serve(listener, build_app(engine)).await?;

    store.close().await;
    Ok(())
}
