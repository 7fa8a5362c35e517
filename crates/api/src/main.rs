//! Supportdesk API server

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use supportdesk_api::{
    auth::{IdentityProvider, JwtManager},
    chat::{spawn_purge_sweeper, ChatStore, MemoryChatStore, PgChatStore},
    config::{Config, StoreBackend},
    routes::create_router,
    websocket::Hub,
    AppState,
};
use supportdesk_shared::db;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Missing .env is fine; variables may be set externally
    let _ = dotenvy::dotenv();

    let config = Config::from_env().context("failed to load configuration")?;
    init_tracing(config.json_logs);

    let store: Arc<dyn ChatStore> = match config.store_backend {
        StoreBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the postgres backend")?;

            let migration_pool = db::create_migration_pool(url)
                .await
                .context("failed to connect for migrations")?;
            db::run_migrations(&migration_pool)
                .await
                .context("failed to run migrations")?;
            migration_pool.close().await;

            let pool = db::create_pool(url, config.database_max_connections)
                .await
                .context("failed to connect to database")?;
            tracing::info!(max_connections = config.database_max_connections, "Database pool ready");
            Arc::new(PgChatStore::new(pool))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store; data is lost on restart");
            Arc::new(MemoryChatStore::new())
        }
    };

    let identity: Arc<dyn IdentityProvider> = Arc::new(JwtManager::new(&config.jwt_secret, 24));
    let hub = Hub::spawn();
    let _sweeper = spawn_purge_sweeper(Arc::clone(&store), config.purge_interval());

    let bind_address = config.bind_address.clone();
    let state = AppState::new(config, store, hub, identity);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    tracing::info!(address = %bind_address, "Supportdesk API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("supportdesk_api=info,tower_http=info"));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
