//! Command-line flags for the agent binary.

use clap::Parser;
use rand::distributions::Alphanumeric;
use rand::Rng;

#[derive(Debug, Parser)]
#[command(name = "tunnel-agent", about = "Local agent for the HTTP/WebSocket reverse tunnel")]
pub struct Args {
    /// Port of the local service to tunnel traffic to.
    #[arg(long)]
    pub port: u16,

    /// Subdomain to register with the broker. Defaults to a fresh random
    /// 10-character lowercase alphanumeric label.
    #[arg(long)]
    pub subdomain: Option<String>,

    /// Broker address to dial, as `host:port`.
    #[arg(long, default_value = "localhost:8080")]
    pub server: String,
}

impl Args {
    pub fn subdomain_or_random(&self) -> String {
        self.subdomain.clone().unwrap_or_else(random_subdomain)
    }
}

fn random_subdomain() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .filter(|b| b.is_ascii_alphanumeric())
        .map(|b| (b as char).to_ascii_lowercase())
        .take(10)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_subdomain_is_ten_lowercase_alphanumerics() {
        let s = random_subdomain();
        assert_eq!(s.len(), 10);
        assert!(s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
