mod cli;
mod codes;
mod command;
mod config;
mod protocol;
mod registry;
mod room;
mod sync;
mod websocket;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    cli::{Cli, Commands},
    config::Config,
    registry::{run_sweeper, MemoryRoomStore, SharedRoomStore},
    websocket::{
        data_source_path_handler, data_source_query_handler, frontend_handler, AppState,
    },
};
use clap::Parser;

async fn health_check() -> &'static str {
    "OK"
}

#[tokio::main]
async fn main() {
    // Default to INFO level if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    // Check if running as debug client
    if let Some(Commands::Debug { url, command }) = cli.command {
        if let Err(e) = cli::run_debug_client(url, command).await {
            error!("Debug client error: {}", e);
            std::process::exit(1);
        }
        return;
    }

    // Otherwise, run as server
    let config = Arc::new(Config::from_env());
    info!("Starting voice chat relay on port {}", config.port);
    info!(
        "Sync poll interval: {} ms, pending room TTL: {} s",
        config.poll_interval_ms, config.pending_room_ttl_seconds
    );

    let store: SharedRoomStore = Arc::new(MemoryRoomStore::new());

    // Garbage-collect rooms whose data source never arrived
    tokio::spawn(run_sweeper(store.clone(), config.clone()));

    let state = AppState {
        store,
        config: config.clone(),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/mcws/:room_id", get(data_source_path_handler))
        .route("/mcws", get(data_source_query_handler))
        .route("/frontendws", get(frontend_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    info!("Voice chat relay listening on {}", addr);

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
