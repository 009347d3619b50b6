//! Command-line flags for the broker binary.

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "tunnel-broker", about = "Public-facing HTTP/WebSocket reverse tunnel broker")]
pub struct Args {
    /// TCP port the broker listens on for both registration and ingress.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Grace period given to in-flight exchanges after a shutdown signal.
    #[arg(long, default_value_t = 30)]
    pub shutdown_grace_seconds: u64,
}
