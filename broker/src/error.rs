//! Typed errors for the broker, following the taxonomy in the design:
//! Transport, Protocol, Client-facing, Shutdown. A single value drives both
//! the HTTP status surfaced to the external caller and the log line an
//! operator sees, instead of matching on string content at each call site.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tunnel_wire::WireError;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Socket read/write/EOF against a session. The session is always
    /// closed; a caller waiting on the exchange sees `500`.
    #[error("transport error: {0}")]
    Transport(#[from] WireError),

    /// Malformed HTTP on the session, unexpected frame, or a non-101
    /// response to an upgrade forwarded to the agent.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No tunnel for the requested subdomain.
    #[error("no tunnel registered for subdomain {0:?}")]
    NoTunnel(String),

    /// The session's use flag was already claimed by another exchange.
    #[error("tunnel for subdomain {0:?} is busy")]
    Busy(String),

    /// Registration request was malformed (missing/empty subdomain).
    #[error("bad registration request: {0}")]
    BadRegistration(String),

    /// Registration attempted for a subdomain that is already bound.
    #[error("subdomain {0:?} is already bound")]
    Conflict(String),
}

impl BrokerError {
    /// The HTTP status an external caller should see for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            BrokerError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BrokerError::Protocol(_) => StatusCode::BAD_GATEWAY,
            BrokerError::NoTunnel(_) => StatusCode::NOT_FOUND,
            BrokerError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
            BrokerError::BadRegistration(_) => StatusCode::BAD_REQUEST,
            BrokerError::Conflict(_) => StatusCode::CONFLICT,
        }
    }

    /// The short, client-visible message for this error. Distinct from the
    /// `Display` impl, which is meant for logs and may carry more detail.
    pub fn client_message(&self) -> String {
        match self {
            BrokerError::Transport(_) | BrokerError::Protocol(_) => "forwarding error\n".to_string(),
            BrokerError::NoTunnel(_) => "Tunnel not found\n".to_string(),
            BrokerError::Busy(_) => "No available tunnels\n".to_string(),
            BrokerError::BadRegistration(msg) => format!("{msg}\n"),
            BrokerError::Conflict(sub) => format!("subdomain {sub:?} is already bound\n"),
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        (self.status(), self.client_message()).into_response()
    }
}
