//! The agent side of the WebSocket bridge (§4.5): accepts the upgrade
//! request mirrored onto the session by the broker, answers it with a
//! computed `101`, dials the local service's own WebSocket endpoint, and
//! splices frames between the two for the remainder of the session's
//! life.

use futures::{SinkExt, StreamExt};
use http::{HeaderMap, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tracing::{info, warn};

use tunnel_wire::{compute_accept_key, decode_message, encode_message, write_response_head, Decoded, Opcode, RequestHead};

use crate::error::AgentError;
use crate::session::Session;

/// Answers the mirrored upgrade request on the session, dials the local
/// service's WebSocket endpoint, and runs the bridge until either side
/// closes. Consumes the session: once a socket has spoken WebSocket
/// frames it can never return to HTTP mode (§6).
pub async fn run(local_port: u16, mut session: Session, head: RequestHead) -> Result<(), AgentError> {
    let accept = compute_sec_websocket_accept(&head.headers)?;
    write_handshake_response(&mut session, &accept).await?;

    let url = format!("ws://localhost:{local_port}{}", head.uri);
    let (local_ws, _response) = tokio_tungstenite::connect_async(&url).await?;
    info!(path = %head.uri, "agent-side websocket bridge opened");

    let (mut local_sink, mut local_stream) = local_ws.split();
    let Session { mut reader, mut writer } = session;

    let forward = async {
        loop {
            match decode_message(&mut reader).await {
                Ok(Decoded::Message(msg)) => {
                    let is_close = msg.opcode == Opcode::Close;
                    let tungstenite_msg = wire_to_tungstenite_message(msg.opcode, msg.payload);
                    if local_sink.send(tungstenite_msg).await.is_err() {
                        break;
                    }
                    if is_close {
                        break;
                    }
                }
                Ok(Decoded::NoMessage) => continue,
                Err(e) => {
                    warn!(error = %e, "reading frame from session failed");
                    break;
                }
            }
        }
    };

    let reverse = async {
        loop {
            let msg = match local_stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    warn!(error = %e, "local websocket read failed");
                    break;
                }
                None => break,
            };
            let (opcode, payload) = tungstenite_to_wire_message(msg);
            let is_close = opcode == Opcode::Close;
            if let Err(e) = encode_message(&mut writer, opcode, &payload).await {
                warn!(error = %e, "forwarding frame to session failed");
                break;
            }
            if is_close {
                break;
            }
        }
    };

    tokio::join!(forward, reverse);
    let _ = writer.shutdown().await;
    info!("agent-side websocket bridge closed");
    Ok(())
}

fn compute_sec_websocket_accept(headers: &HeaderMap) -> Result<String, AgentError> {
    let key = headers
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AgentError::Protocol("upgrade request missing Sec-WebSocket-Key".into()))?;
    Ok(compute_accept_key(key))
}

async fn write_handshake_response(session: &mut Session, accept: &str) -> Result<(), AgentError> {
    let mut headers = HeaderMap::new();
    headers.insert(http::header::UPGRADE, "websocket".parse().unwrap());
    headers.insert(http::header::CONNECTION, "Upgrade".parse().unwrap());
    headers.insert("sec-websocket-accept", accept.parse().map_err(|_| AgentError::Protocol("invalid accept key".into()))?);
    write_response_head(&mut session.writer, StatusCode::SWITCHING_PROTOCOLS, &headers).await?;
    session.writer.flush().await?;
    Ok(())
}

fn wire_to_tungstenite_message(opcode: Opcode, payload: Vec<u8>) -> TungsteniteMessage {
    match opcode {
        Opcode::Text => TungsteniteMessage::Text(String::from_utf8_lossy(&payload).into_owned().into()),
        Opcode::Binary | Opcode::Continuation => TungsteniteMessage::Binary(payload.into()),
        Opcode::Ping => TungsteniteMessage::Ping(payload.into()),
        Opcode::Pong => TungsteniteMessage::Pong(payload.into()),
        Opcode::Close => TungsteniteMessage::Close(None),
    }
}

fn tungstenite_to_wire_message(msg: TungsteniteMessage) -> (Opcode, Vec<u8>) {
    match msg {
        TungsteniteMessage::Text(t) => (Opcode::Text, t.as_bytes().to_vec()),
        TungsteniteMessage::Binary(b) => (Opcode::Binary, b.to_vec()),
        TungsteniteMessage::Ping(b) => (Opcode::Ping, b.to_vec()),
        TungsteniteMessage::Pong(b) => (Opcode::Pong, b.to_vec()),
        TungsteniteMessage::Close(_) => (Opcode::Close, Vec::new()),
        TungsteniteMessage::Frame(_) => (Opcode::Binary, Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computes_accept_key_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==".parse().unwrap());
        assert_eq!(compute_sec_websocket_accept(&headers).unwrap(), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn rejects_missing_key() {
        assert!(compute_sec_websocket_accept(&HeaderMap::new()).is_err());
    }
}
