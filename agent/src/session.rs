//! The agent's single session socket: the hijacked half of the connection
//! the broker dialed us on, after registration completes.

use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};

/// Boxed so a session can be driven over whatever stream registration
/// actually produced (a real `TcpStream` half in production, a
/// `tokio::io::duplex` half in tests).
pub type SessionReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
pub type SessionWriter = BufWriter<Box<dyn AsyncWrite + Send + Unpin>>;

pub struct Session {
    pub reader: SessionReader,
    pub writer: SessionWriter,
}

impl Session {
    pub fn new(reader: SessionReader, writer: SessionWriter) -> Self {
        Self { reader, writer }
    }
}
