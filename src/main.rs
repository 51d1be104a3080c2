//! Exercise Pool · generated-exercise backend
//!
//! - Axum HTTP API for issuing exercises and administering the pool
//! - Pre-generated stock per template, topped up in the background
//! - Optional OpenAI integration (via environment variables)
//!
//! Important env variables:
//!   PORT              : u16 (default 3000)
//!   OPENAI_API_KEY    : enables OpenAI generation if present
//!   OPENAI_BASE_URL   : default "https://api.openai.com/v1"
//!   OPENAI_MODEL      : default "gpt-4o-mini"
//!   POOL_CONFIG_PATH  : path to TOML config (pool tuning, prompts, template bank)
//!   LOG_LEVEL         : tracing filter, e.g. "debug" or full directives
//!   LOG_FORMAT        : "pretty" (default) or "json"

mod telemetry;
mod util;
mod domain;
mod error;
mod config;
mod seeds;
mod catalog;
mod store;
mod openai;
mod generator;
mod replenish;
mod pool;
mod maintenance;
mod state;
mod protocol;
mod routes;
#[cfg(test)]
mod testing;

use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::{info, instrument};

use crate::routes::build_router;
use crate::state::AppState;

#[instrument(level = "info", skip_all)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  telemetry::init_tracing();

  // Build shared application state (config, catalog, generation client, pool).
  let state = Arc::new(AppState::new());

  // Periodic top-up of popular templates and stale-stock cleanup.
  let _maintenance = maintenance::spawn(state.pool.clone());

  let app = build_router(state.clone());

  // Read port from env or default to 3000.
  let addr: SocketAddr = std::env::var("PORT")
    .ok()
    .and_then(|p| p.parse::<u16>().ok())
    .map(|port| SocketAddr::from(([0, 0, 0, 0], port)))
    .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

  let listener = TcpListener::bind(addr).await?;
  info!(target: "exercise_pool", %addr, "HTTP server listening");
  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await?;
  info!(target: "exercise_pool", "Server stopped");
  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    tracing::error!(target: "exercise_pool", error = %e, "Could not install Ctrl-C handler");
    std::future::pending::<()>().await;
  }
  info!(target: "exercise_pool", "Shutdown signal received");
}
