use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pqxdh_relay::config::Config;
use pqxdh_relay::context::AppContext;
use pqxdh_relay::routes::create_router;
use pqxdh_relay::storage::{MemoryStore, PgStore, RelayStore};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    let config = Arc::new(config);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.rust_log.clone()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("=== PQXDH Relay Starting ===");
    info!("Port: {}", config.port);
    info!(
        "Rate limit: {} req/s, {}s penalty",
        config.rate_limit.requests_per_second, config.rate_limit.timeout_period_secs
    );

    let store: Arc<dyn RelayStore> = match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url).await?;
            info!("Storage backend: postgres");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory store (state is lost on restart)");
            Arc::new(MemoryStore::new())
        }
    };

    let ctx = Arc::new(AppContext::new(store, config.clone()));
    let app = create_router(ctx);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("Server error")?;

    Ok(())
}
