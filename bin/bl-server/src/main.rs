//! Batchline Server
//!
//! Receives JSON entries over HTTP, aggregates them per channel and forwards
//! merged batches to each channel's target.
//!
//! ## Configuration
//!
//! Loaded from `BATCHLINE_CONFIG` or the standard search paths, with
//! `BATCHLINE_*` environment overrides. Set `LOG_FORMAT=json` for JSON logs.

use std::sync::Arc;

use anyhow::{Context, Result};
use bl_config::ConfigLoader;
use bl_relay::{api, ConfigReloader, Relay};
use tokio::{net::TcpListener, signal};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    bl_common::logging::init_logging("bl-server");

    info!("Starting Batchline server");

    // 1. Load configuration
    let loader = ConfigLoader::new();
    let config = loader.load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    info!(
        channels = config.channels.len(),
        data_dir = %config.data_dir,
        workers = config.engine.dispatch_workers,
        "Configuration loaded"
    );
    if config.channels.is_empty() {
        warn!("No channels configured - every entry will be discarded until a reload adds some");
    }

    // 2. Build and start the relay
    let relay: Arc<Relay> = Relay::from_config(&config)
        .await
        .context("failed to build relay")?;
    relay.start().await.context("failed to start relay")?;

    // 3. Hot reload of channel settings
    match config.engine.reload_interval() {
        Some(period) => ConfigReloader::new(loader, relay.clone()).spawn(period),
        None => info!("Config hot reload disabled"),
    }

    // 4. HTTP receiver
    let app = api::router(relay.clone()).layer(TraceLayer::new_for_http());
    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(addr = %addr, "HTTP receiver listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(e) = server.await {
        error!(error = %e, "HTTP server error");
    }

    // 5. Drain and persist
    info!("Shutdown signal received...");
    relay.shutdown().await;

    info!("Batchline server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
