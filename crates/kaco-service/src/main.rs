//! KACO Service - Inverter poller and HTTP API.
//!
//! Run with: `cargo run -p kaco-service`

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use kaco_service::{AppState, Collector, Config, api, config::default_config_path};
use kaco_store::Store;

/// KACO Service - Inverter poller and HTTP REST API.
#[derive(Parser, Debug)]
#[command(name = "kaco-service")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config).
    #[arg(short, long)]
    bind: Option<String>,

    /// Database path (overrides config).
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Disable background collector (API only mode).
    #[arg(long)]
    no_collector: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("kaco_service=info".parse()?)
                .add_directive("kaco_core=info".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    // Load configuration
    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = if config_path.exists() {
        Config::load(&config_path)?
    } else {
        info!("No configuration at {:?}, using defaults", config_path);
        Config::default()
    };

    // Stable entry ids must survive restarts
    if config.ensure_entry_ids() {
        match config.save(&config_path) {
            Ok(()) => info!("Assigned entry ids, saved {:?}", config_path),
            Err(e) => warn!("Entry ids assigned but not saved: {}", e),
        }
    }

    // Override config with CLI args
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(db_path) = args.database {
        config.storage.path = db_path;
    }
    config.validate()?;

    // Open the database
    info!("Opening database at {:?}", config.storage.path);
    let store = Store::open(&config.storage.path)
        .with_context(|| format!("opening {:?}", config.storage.path))?;

    let addr: SocketAddr = config.server.bind.parse()?;
    let state = AppState::new(store, config);

    // Start the background collector
    let collector = Collector::new(Arc::clone(&state));
    if !args.no_collector {
        let started = collector.start().await;
        info!("Collector polling {} device(s)", started);
    } else {
        info!("Background collector disabled");
    }

    // Build the router
    let app = Router::new()
        .merge(api::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    info!("Starting server on {}", addr);

    // Run the server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    collector.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
