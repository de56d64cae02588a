//! Main entry point for the imaging-bridge server.

use anyhow::{Context, Result};
use imaging_bridge::api::{build_router, AppState};
use imaging_bridge::config::Settings;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first; its log level seeds the default filter.
    let settings = Settings::load().context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{},hyper=warn", settings.application.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting imaging-bridge");
    tracing::info!(
        channel = %settings.channel.endpoint(),
        timeout_ms = settings.channel.timeout_ms,
        "Device channel configured"
    );

    let state =
        AppState::from_settings(&settings).context("Failed to build application state")?;

    // Fail fast on an unreachable device endpoint rather than on the first
    // trigger. Not fatal: the client redials per exchange.
    if let Err(e) = state.channel.connect().await {
        tracing::warn!(error = %e, "Device channel not reachable at startup");
    }

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&settings.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", settings.server.bind_addr))?;
    tracing::info!(addr = %settings.server.bind_addr, "REST API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    tracing::info!("imaging-bridge shut down");
    Ok(())
}
