//! HTTP caching reverse proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!                     ┌──────────────────────────────────────────────────────┐
//!                     │                   CACHING PROXY                      │
//!   Client Request    │  ┌────────┐   ┌─────────────┐   ┌───────────────┐    │
//!   ──────────────────┼─▶│  http  │──▶│    cache    │──▶│   security    │────┼──▶ Origin
//!                     │  │ server │   │ coordinator │   │  sanitizer    │    │
//!                     │  └────────┘   └──────┬──────┘   └───────────────┘    │
//!                     │                      │                               │
//!                     │         ┌────────────┼────────────┐                  │
//!                     │         ▼            ▼            ▼                  │
//!                     │   ┌─────────┐  ┌───────────┐ ┌──────────┐            │
//!                     │   │  store  │  │ surrogate │ │ strategy │            │
//!                     │   │ (disk)  │  │  ESI/SSI  │ │ (merge)  │            │
//!                     │   └─────────┘  └───────────┘ └──────────┘            │
//!                     │                                                      │
//!                     │  config (hot reload) · observability · admin API     │
//!                     └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use http_cache_proxy::admin::setup_admin_router;
use http_cache_proxy::config::{load_config, ConfigWatcher, ProxyConfig};
use http_cache_proxy::observability::{logging, metrics};
use http_cache_proxy::{HttpServer, Shutdown};

#[derive(Parser)]
#[command(name = "http-cache-proxy")]
#[command(about = "HTTP caching reverse proxy with ESI/SSI assembly", long_about = None)]
struct Args {
    /// Path to the TOML configuration file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };

    logging::init_logging(&config.observability.log_level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "http-cache-proxy starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        origin = %config.origin.address,
        store = %config.store.root,
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    // Keep the watcher alive for the lifetime of the process.
    let (config_updates, _watcher) = match &args.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            match watcher.run() {
                Ok(handle) => (updates, Some(handle)),
                Err(e) => {
                    tracing::warn!(error = %e, "Config hot reload disabled");
                    (updates, None)
                }
            }
        }
        None => (mpsc::unbounded_channel().1, None),
    };

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    let server = HttpServer::new(config.clone())?;

    if config.admin.enabled {
        let admin_listener = TcpListener::bind(&config.admin.bind_address).await?;
        tracing::info!(address = %admin_listener.local_addr()?, "Admin API listening");
        let admin = setup_admin_router(server.state());
        let mut admin_shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            let result = axum::serve(admin_listener, admin)
                .with_graceful_shutdown(async move {
                    let _ = admin_shutdown.recv().await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "Admin API server failed");
            }
        });
    }

    let server_shutdown = shutdown.subscribe();
    tokio::spawn(shutdown.clone().trigger_on_signal());

    server.run(listener, config_updates, server_shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
