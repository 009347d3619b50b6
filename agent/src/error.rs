//! Typed errors for the agent, mirroring the broker's taxonomy (Transport,
//! Protocol, Shutdown) minus the client-facing variants a broker needs to
//! turn into HTTP statuses — the agent has no external caller to answer.

use thiserror::Error;
use tunnel_wire::WireError;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Socket read/write/EOF against the session, or the initial dial to
    /// the broker.
    #[error("transport error: {0}")]
    Transport(#[from] WireError),

    /// Malformed HTTP on the session, a non-101 registration response, or
    /// an unexpected frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The local service rejected or failed the forwarded request.
    #[error("local service error: {0}")]
    LocalService(#[from] reqwest::Error),

    /// Dialing the local service's own WebSocket endpoint failed.
    #[error("local websocket dial failed: {0}")]
    LocalWebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
