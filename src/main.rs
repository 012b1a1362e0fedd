use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tally::api::{self, AppState};
use tally::clock::{RandomPurgeChance, SystemClock};
use tally::config::{Config, DedupMode};
use tally::counter::VisitCounter;
use tally::storage::{self, CachedStorage, Storage};
use tally::visitor::VisitorIdentity;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tally=info")),
        )
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!("Loaded configuration");

    // Initialize storage
    let mut storage = storage::open_storage(&config.storage).await?;
    info!("Initializing storage...");
    storage.init().await?;
    info!("Storage initialized successfully");

    let dedup_mode = config.counter.dedup_mode;
    if dedup_mode == DedupMode::Window && config.storage.cache_entries > 0 {
        info!(
            "Caching up to {} recent visitors",
            config.storage.cache_entries
        );
        let cached: Arc<dyn Storage> = Arc::new(CachedStorage::new(
            storage,
            config.storage.cache_entries,
            config.counter.window_secs,
        ));
        storage = cached;
    }

    let counter = Arc::new(VisitCounter::new(
        storage,
        Arc::new(SystemClock),
        Arc::new(RandomPurgeChance::new(config.counter.purge_one_in)),
        config.counter.window_secs,
    ));

    let identity = VisitorIdentity::new(config.visitor.id_salt.as_deref())?;

    match dedup_mode {
        DedupMode::Window => {
            info!(
                "👣 Counting unique visitors per {}s window (proxy mode: {:?}, pseudonymized ids: {})",
                config.counter.window_secs,
                config.visitor.trusted_proxy_mode,
                identity.is_pseudonymized()
            );
        }
        DedupMode::Session => {
            info!(
                "🍪 Counting once per browser session (cookie: {})",
                config.counter.session_cookie_name
            );
        }
    }

    match counter.current_count().await {
        Ok(count) => info!("Current visit count: {}", count),
        Err(e) => tracing::warn!("Could not read visit count at startup: {}", e),
    }

    let state = Arc::new(AppState {
        counter,
        dedup_mode,
        visitor: config.visitor.clone(),
        identity,
        session_cookie_name: config.counter.session_cookie_name.clone(),
    });

    let app = api::create_api_router(state, &config.frontend);

    if let Some(ref static_dir) = config.frontend.static_dir {
        info!("🎨 Serving static site from directory: {}", static_dir);
    }

    // Start API server
    let api_addr = format!("{}:{}", config.api_server.host, config.api_server.port);
    let listener = tokio::net::TcpListener::bind(&api_addr).await?;
    info!("🚀 Visit counter listening on http://{}", api_addr);
    info!("   - Count endpoint at http://{}/visit-count", api_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
