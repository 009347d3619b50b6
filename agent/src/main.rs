//! # Tunnel Agent
//!
//! The developer-side half of the reverse tunnel: dials the broker,
//! registers a subdomain, and forwards the broker's traffic to a local
//! service for the lifetime of the session.
//!
//! ## Modules
//!
//! - [`cli`]          — command-line flags
//! - [`error`]         — the agent's typed error hierarchy
//! - [`session`]       — the hijacked session socket
//! - [`registration`]  — the `/_tunnel` registration handshake
//! - [`control`]       — the HTTP request/response loop over the session
//! - [`forward`]       — forwarding one request to the local service
//! - [`bridge`]        — the agent side of the WebSocket bridge

mod bridge;
mod cli;
mod control;
mod error;
mod forward;
mod registration;
mod session;

use clap::Parser;
use tracing::{error, info};

use crate::cli::Args;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "tunnel_agent=info".into()))
        .init();

    let args = Args::parse();
    let subdomain = args.subdomain_or_random();

    let session = match registration::register(&args.server, &subdomain).await {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "registration failed");
            std::process::exit(1);
        }
    };

    info!(subdomain, local_port = args.port, server = args.server, "tunnel established");

    let client = reqwest::Client::new();
    control::run(client, args.port, session).await;

    info!("session ended, shutting down");
}
