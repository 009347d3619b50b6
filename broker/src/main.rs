//! # Tunnel Broker
//!
//! The public-facing half of the reverse tunnel: agents register under a
//! subdomain and the broker relays external HTTP and WebSocket traffic to
//! them over the resulting session.
//!
//! ## Modules
//!
//! - [`registry`]  — subdomain → session mapping
//! - [`session`]   — one hijacked agent socket and its exclusive-use flag
//! - [`handshake`] — the `/_tunnel` registration endpoint
//! - [`ingress`]   — plain HTTP request/response dispatch over a session
//! - [`bridge`]    — the WebSocket bridge
//! - [`liveness`]  — per-session EOF watcher
//! - [`error`]     — the broker's typed error hierarchy
//! - [`cli`]       — command-line flags
//! - [`context`]   — shared application state

mod bridge;
mod cli;
mod context;
mod error;
mod handshake;
mod ingress;
mod liveness;
mod registry;
mod session;

#[cfg(test)]
mod integration_tests;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::cli::Args;
use crate::context::AppState;

async fn route(State(state): State<AppState>, req: Request<Body>) -> Response {
    if bridge::is_websocket_upgrade(req.headers()) {
        bridge::handle(state, req).await
    } else {
        ingress::dispatch(State(state), req).await
    }
}

/// Builds the broker's router over a given [`AppState`], independent of
/// binding a listener or running the signal-driven shutdown machinery, so
/// tests can drive a real instance on a loopback port without going
/// through `main`.
pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/_tunnel", get(handshake::register))
        .fallback(route)
        .with_state(state)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "tunnel_broker=info".into()))
        .init();

    let args = Args::parse();
    let shutdown_grace = Duration::from_secs(args.shutdown_grace_seconds);
    let state = AppState::new(shutdown_grace);
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!(addr = %addr, "tunnel broker listening");

    let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind listener");

    // The serve future itself only knows how to drain forever once asked;
    // the grace deadline is enforced out here by racing its completion
    // against a timeout that starts the moment the shutdown signal fires.
    let shutdown = Arc::new(Notify::new());
    let serve_shutdown = shutdown.clone();
    let serve_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { serve_shutdown.notified().await })
            .await
    });

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining in-flight exchanges");
    shutdown.notify_waiters();

    match tokio::time::timeout(shutdown_grace, serve_task).await {
        Ok(Ok(Ok(()))) => info!("tunnel broker shut down cleanly"),
        Ok(Ok(Err(e))) => warn!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => warn!(error = %e, "serve task panicked during shutdown"),
        Err(_) => {
            warn!(grace_seconds = shutdown_grace.as_secs(), "shutdown grace period elapsed with connections still draining, forcing exit");
            std::process::exit(1);
        }
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
