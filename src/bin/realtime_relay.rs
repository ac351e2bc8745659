//! Realtime relay: fans Redis channel events out to WebSocket clients.

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rust_crm_api::realtime::{relay_router, run_redis_subscriber, RelayConfig, RelayState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_crm_api=debug,realtime_relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RelayConfig::from_env()?;
    let client = redis::Client::open(config.redis_url.as_str())?;

    let state = Arc::new(RelayState::new(config.token.clone()));
    tokio::spawn(run_redis_subscriber(
        client,
        config.channel.clone(),
        state.tx.clone(),
    ));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(
        "Realtime relay listening on {} (channel '{}')",
        addr,
        config.channel
    );

    axum::serve(listener, relay_router(state)).await?;

    Ok(())
}
