//! The broker side of the WebSocket bridge (§4.5). Entered once the
//! ingress dispatcher sees a request carrying a WebSocket upgrade instead
//! of going through the ordinary request/response path in `ingress`.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{Message as AxumMessage, WebSocketUpgrade};
use axum::extract::FromRequestParts;
use axum::http::{Method, Request};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use tunnel_wire::{decode_message, encode_message, read_response_head, write_request_head, Decoded, Opcode};

use crate::context::AppState;
use crate::error::BrokerError;
use crate::ingress::extract_subdomain;
use crate::registry::Registry;
use crate::session::Session;

pub async fn handle(state: AppState, req: Request<Body>) -> Response {
    let host = req
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();

    let subdomain = match extract_subdomain(&host) {
        Some(s) => s.to_string(),
        None => return BrokerError::NoTunnel(host).into_response(),
    };

    let session = match state.registry.lookup(&subdomain) {
        Some(s) => s,
        None => return BrokerError::NoTunnel(subdomain).into_response(),
    };

    if !session.try_claim() {
        return BrokerError::Busy(subdomain).into_response();
    }

    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let mirrored_headers = req.headers().clone();

    let (mut parts, _body) = req.into_parts();
    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(u) => u,
        Err(rejection) => {
            session.release();
            return rejection.into_response();
        }
    };

    let registry = state.registry.clone();
    upgrade.on_upgrade(move |socket| async move {
        match mirror_upgrade_to_agent(&session, &target, &mirrored_headers).await {
            Ok(()) => {
                info!(subdomain = session.subdomain(), "websocket bridge opened");
                run_bridge(socket, session.clone(), registry.clone()).await;
                info!(subdomain = session.subdomain(), "websocket bridge closed");
            }
            Err(e) => {
                warn!(subdomain = session.subdomain(), error = %e, "agent rejected websocket upgrade");
            }
        }
        session.release();
        shutdown_session(&session).await;
        registry.unbind(session.subdomain(), &session);
    })
}

/// Writes the mirrored upgrade request onto the session and confirms the
/// agent answered with a genuine `101`. Anything else aborts the bridge.
async fn mirror_upgrade_to_agent(session: &Arc<Session>, target: &str, headers: &axum::http::HeaderMap) -> Result<(), BrokerError> {
    {
        let mut writer = session.writer.lock().await;
        write_request_head(&mut *writer, &Method::GET, target, headers).await?;
    }

    let head = {
        let mut reader = session.reader.lock().await;
        read_response_head(&mut *reader).await?
    };

    if head.status != axum::http::StatusCode::SWITCHING_PROTOCOLS {
        return Err(BrokerError::Protocol(format!("agent answered upgrade with {}", head.status)));
    }
    Ok(())
}

/// Splices frames between the genuine external WebSocket connection and
/// the raw frame codec running on the session socket until either side
/// closes. Forward and reverse pumps run concurrently, each holding its
/// own half of the session exclusively for the whole bridge lifetime.
async fn run_bridge(socket: axum::extract::ws::WebSocket, session: Arc<Session>, _registry: Registry) {
    let (mut ext_sink, mut ext_stream) = socket.split();

    let forward = async {
        let mut writer = session.writer.lock().await;
        loop {
            let msg = match ext_stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    warn!(subdomain = session.subdomain(), error = %e, "external websocket read failed");
                    break;
                }
                None => break,
            };
            let (opcode, payload) = axum_message_to_wire(msg);
            let is_close = opcode == Opcode::Close;
            if let Err(e) = encode_message(&mut *writer, opcode, &payload).await {
                error!(subdomain = session.subdomain(), error = %e, "forwarding frame to agent failed");
                break;
            }
            if is_close {
                break;
            }
        }
    };

    let reverse = async {
        let mut reader = session.reader.lock().await;
        loop {
            match decode_message(&mut *reader).await {
                Ok(Decoded::Message(msg)) => {
                    let is_close = msg.opcode == Opcode::Close;
                    let axum_msg = wire_to_axum_message(msg.opcode, msg.payload);
                    if ext_sink.send(axum_msg).await.is_err() {
                        break;
                    }
                    if is_close {
                        break;
                    }
                }
                Ok(Decoded::NoMessage) => continue,
                Err(e) => {
                    warn!(subdomain = session.subdomain(), error = %e, "reading frame from agent failed");
                    break;
                }
            }
        }
    };

    tokio::join!(forward, reverse);
}

/// The session can never return to HTTP mode once it has spoken WebSocket
/// frames, so closing the write half here is what lets the agent's own
/// read loop observe EOF and tear its side down too.
async fn shutdown_session(session: &Session) {
    let mut writer = session.writer.lock().await;
    let _ = writer.shutdown().await;
}

fn axum_message_to_wire(msg: AxumMessage) -> (Opcode, Vec<u8>) {
    match msg {
        AxumMessage::Text(t) => (Opcode::Text, t.as_bytes().to_vec()),
        AxumMessage::Binary(b) => (Opcode::Binary, b.to_vec()),
        AxumMessage::Ping(b) => (Opcode::Ping, b.to_vec()),
        AxumMessage::Pong(b) => (Opcode::Pong, b.to_vec()),
        AxumMessage::Close(_) => (Opcode::Close, Vec::new()),
    }
}

fn wire_to_axum_message(opcode: Opcode, payload: Vec<u8>) -> AxumMessage {
    match opcode {
        Opcode::Text => AxumMessage::Text(String::from_utf8_lossy(&payload).into_owned().into()),
        Opcode::Binary | Opcode::Continuation => AxumMessage::Binary(payload.into()),
        Opcode::Ping => AxumMessage::Ping(payload.into()),
        Opcode::Pong => AxumMessage::Pong(payload.into()),
        Opcode::Close => AxumMessage::Close(None),
    }
}

/// Whether a request's headers declare a WebSocket upgrade, distinguishing
/// the bridge path from the ordinary ingress path in a single fallback
/// route.
pub fn is_websocket_upgrade(headers: &axum::http::HeaderMap) -> bool {
    let connection_has_upgrade = headers
        .get(axum::http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    let upgrade_is_websocket = headers
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    connection_has_upgrade && upgrade_is_websocket
}
