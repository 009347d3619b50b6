//! Error types shared by the broker and agent for everything that touches
//! the raw session socket: HTTP/1.1 framing and the WebSocket frame codec.

use thiserror::Error;

/// Failure modes that can occur while reading or writing the wire protocol
/// carried on a session socket.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed HTTP message: {0}")]
    MalformedHttp(String),

    #[error("malformed websocket frame: {0}")]
    MalformedFrame(String),

    #[error("websocket protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("response declared neither Content-Length nor chunked framing")]
    IndeterminateLength,

    #[error("read timed out with a frame partially consumed")]
    Timeout,
}

pub type WireResult<T> = Result<T, WireError>;
