//! # Tunlify Gateway
//!
//! The public side of a reverse tunnel. Browsers and raw TCP/UDP peers
//! hit this process; it relays their traffic over per-tunnel WebSocket
//! control channels to `tunlify-client` processes sitting next to the
//! origin services.
//!
//! ## Architecture
//!
//! ```text
//! Edge proxy ──HTTP──► Ingress ─┐
//! Public TCP/UDP ──► L4 Ingress ─┤─► Control Channel ──WS──► Client ──► Local Service
//! Dashboard ──REST──► API ──────┘
//! ```
//!
//! ## Modules
//!
//! - [`catalog`]  — durable tunnel rows behind a narrow interface
//! - [`registry`] — `(subdomain, region) → ControlChannel`
//! - [`pending`]  — request-id correlation with one-shot completion
//! - [`handlers`] — WebSocket control-channel lifecycle and dispatch
//! - [`ingress`]  — HTTP ingress (router fallback)
//! - [`l4`]       — per-tunnel TCP/UDP listeners
//! - [`api`]      — management REST surface
//! - [`ports`]    — public-port allocation
//! - [`services`] — service-type presets

mod api;
mod catalog;
mod config;
mod error;
mod handlers;
mod ingress;
mod l4;
mod pending;
mod ports;
mod registry;
mod services;
mod state;
mod validate;

use std::sync::Arc;

use axum::routing::{delete, get, patch, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::catalog::MemoryCatalog;
use crate::config::ServerConfig;
use crate::state::AppState;

/// Server entry point.
///
/// Initializes logging, builds the dependency bundle, wires the router,
/// spawns the janitor, and serves.
#[tokio::main]
async fn main() {
    // Structured logging with env-filter support; override with RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunlify_server=info".into()),
        )
        .init();

    let config = ServerConfig::from_env();
    let listen_addr = config.listen_addr;
    let state = AppState::new(config, Arc::new(MemoryCatalog::new()));

    tokio::spawn(state::run_janitor(state.clone()));

    let app = Router::new()
        // Control channels
        .route("/ws/tunnel", get(handlers::ws_handler))
        // Management surface
        .route("/tunnels", get(api::list_tunnels).post(api::create_tunnel))
        .route("/tunnels/presets", get(api::presets))
        .route("/tunnels/auth", post(api::auth_tunnel))
        .route("/tunnels/{id}", delete(api::delete_tunnel))
        .route("/tunnels/{id}/status", patch(api::update_status))
        // Everything else is proxied tunnel traffic from the edge
        .fallback(ingress::handle)
        .layer(CorsLayer::permissive())
        .with_state(state);

    info!("Tunlify gateway listening on {}", listen_addr);

    let listener = tokio::net::TcpListener::bind(listen_addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
