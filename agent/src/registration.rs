//! Dials the broker and performs the registration handshake
//! (`GET /_tunnel?subdomain=<s>`), producing the [`Session`] the control
//! loop then drives for the rest of the process's lifetime.

use http::{HeaderMap, Method, StatusCode};
use tokio::io::{split, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tracing::info;

use tunnel_wire::{read_response_head, write_request_head};

use crate::error::AgentError;
use crate::session::Session;

/// Connects to `server`, writes the registration request for `subdomain`,
/// and confirms the broker answered `101`. The returned [`Session`] owns
/// the buffered reader/writer pair the rest of the agent runs against.
pub async fn register(server: &str, subdomain: &str) -> Result<Session, AgentError> {
    let stream = TcpStream::connect(server).await?;
    let (read_half, write_half) = split(stream);
    let mut reader = BufReader::new(Box::new(read_half) as Box<dyn tokio::io::AsyncRead + Send + Unpin>);
    let mut writer = BufWriter::new(Box::new(write_half) as Box<dyn tokio::io::AsyncWrite + Send + Unpin>);

    let target = format!("/_tunnel?subdomain={subdomain}");
    let mut headers = HeaderMap::new();
    headers.insert(http::header::HOST, server.parse().map_err(|_| AgentError::Protocol("invalid server address".into()))?);

    write_request_head(&mut writer, &Method::GET, &target, &headers).await?;
    writer.flush().await?;

    let head = read_response_head(&mut reader).await?;
    if head.status != StatusCode::SWITCHING_PROTOCOLS {
        return Err(AgentError::Protocol(format!("registration rejected with {}", head.status)));
    }

    info!(subdomain, server, "registered with broker");
    Ok(Session::new(reader, writer))
}
