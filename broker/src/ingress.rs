//! The plain-HTTP ingress dispatcher (§4.3): resolves a subdomain from the
//! host header, claims exclusive use of its session, and drives one
//! request/response exchange over it.

use std::future::Future;
use std::sync::Arc;

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, Request};
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, warn};

use tunnel_wire::{copy_body, is_hop_by_hop_header, read_response_head, response_framing, write_request_head, BodyFraming};

use crate::context::AppState;
use crate::error::BrokerError;
use crate::session::Session;

/// Requests larger than this are rejected rather than buffered whole.
/// Responses are streamed and have no such cap.
const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024 * 1024;

/// The leftmost dot-separated label of a `Host` header, used as the
/// registry key. A host with no dot, or an empty leading label, has no
/// tunnel to resolve to.
pub fn extract_subdomain(host: &str) -> Option<&str> {
    let host = host.split(':').next().unwrap_or(host);
    let (label, rest) = host.split_once('.')?;
    if label.is_empty() || rest.is_empty() {
        return None;
    }
    Some(label)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let hop_by_hop: Vec<_> = headers.keys().filter(|name| is_hop_by_hop_header(name.as_str())).cloned().collect();
    for name in hop_by_hop {
        headers.remove(name);
    }
}

pub async fn dispatch(State(state): State<AppState>, req: Request<Body>) -> Response {
    let host = req
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    let subdomain = match extract_subdomain(host) {
        Some(s) => s.to_string(),
        None => return BrokerError::NoTunnel(host.to_string()).into_response(),
    };

    let session = match state.registry.lookup(&subdomain) {
        Some(s) => s,
        None => return BrokerError::NoTunnel(subdomain).into_response(),
    };

    if !session.try_claim() {
        return BrokerError::Busy(subdomain).into_response();
    }

    match forward_exchange(session.clone(), state.registry.clone(), req).await {
        Ok(response) => response,
        Err(e) => {
            session.release();
            if matches!(e, BrokerError::Transport(_) | BrokerError::Protocol(_)) {
                error!(subdomain = session.subdomain(), error = %e, "forwarding failed, unbinding session");
                state.registry.unbind(&subdomain, &session);
            } else {
                warn!(subdomain = session.subdomain(), error = %e, "request rejected");
            }
            e.into_response()
        }
    }
}

/// Writes the request onto the session and starts streaming the response
/// back. The session's use flag is released by the spawned body-copy task
/// once the response body has finished (or immediately, for bodiless
/// responses) — not by this function, so the exchange stays exclusive for
/// its whole duration rather than just its head.
async fn forward_exchange(session: Arc<Session>, registry: crate::registry::Registry, req: Request<Body>) -> Result<Response, BrokerError> {
    let (parts, body) = req.into_parts();
    let is_head = parts.method == Method::HEAD;

    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut request_headers = parts.headers.clone();
    strip_hop_by_hop(&mut request_headers);

    let body_bytes = to_bytes(body, MAX_REQUEST_BODY_BYTES)
        .await
        .map_err(|e| BrokerError::Protocol(format!("reading request body: {e}")))?;
    if !body_bytes.is_empty() {
        request_headers.insert(axum::http::header::CONTENT_LENGTH, body_bytes.len().into());
    } else {
        request_headers.remove(axum::http::header::CONTENT_LENGTH);
    }

    {
        let mut writer = session.writer.lock().await;
        write_request_head(&mut *writer, &parts.method, &target, &request_headers).await?;
        if !body_bytes.is_empty() {
            use tokio::io::AsyncWriteExt;
            writer.write_all(&body_bytes).await.map_err(tunnel_wire::WireError::Io)?;
            writer.flush().await.map_err(tunnel_wire::WireError::Io)?;
        }
    }

    let head = {
        let mut reader = session.reader.lock().await;
        read_response_head(&mut *reader).await?
    };
    let framing = response_framing(head.status, is_head, &head.headers)?;

    debug!(subdomain = session.subdomain(), method = %parts.method, path = %target, status = head.status.as_u16(), "forwarded request");

    let mut response_headers = head.headers.clone();
    strip_hop_by_hop(&mut response_headers);

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
    let body_session = session.clone();
    let body_registry = registry;
    let subdomain = body_session.subdomain().to_string();
    tokio::spawn(async move {
        let result = stream_response_body(&body_session, framing, &tx).await;
        body_session.release();
        if let Err(e) = result {
            error!(subdomain = %subdomain, error = %e, "streaming response body failed, unbinding session");
            body_registry.unbind(&subdomain, &body_session);
        }
    });

    let stream_body = Body::from_stream(ReceiverStream::new(rx));
    let mut builder = Response::builder().status(head.status);
    *builder.headers_mut().expect("builder has no prior error") = response_headers;
    builder.body(stream_body).map_err(|e| BrokerError::Protocol(format!("building response: {e}")))
}

async fn stream_response_body(
    session: &Session,
    framing: BodyFraming,
    tx: &mpsc::Sender<Result<Bytes, std::io::Error>>,
) -> Result<(), tunnel_wire::WireError> {
    if framing == BodyFraming::None {
        return Ok(());
    }

    let mut reader = session.reader.lock().await;
    // Adapts the channel into an `AsyncWrite` so `copy_body`'s normal
    // chunked/fixed-length copy loop becomes the producer side of the
    // response stream.
    let mut sink = ChannelSink::new(tx.clone());
    copy_body(&mut *reader, &mut sink, framing).await
}

/// Adapts an `mpsc::Sender` into an `AsyncWrite` so [`copy_body`] can
/// stream straight from the session's buffered reader into the outbound
/// response body, one read-sized chunk at a time, without buffering the
/// whole body first.
struct ChannelSink {
    tx: Option<mpsc::Sender<Result<Bytes, std::io::Error>>>,
    pending: Option<std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), usize>> + Send>>>,
}

impl ChannelSink {
    fn new(tx: mpsc::Sender<Result<Bytes, std::io::Error>>) -> Self {
        Self { tx: Some(tx), pending: None }
    }
}

impl tokio::io::AsyncWrite for ChannelSink {
    fn poll_write(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>, buf: &[u8]) -> std::task::Poll<std::io::Result<usize>> {
        if self.pending.is_none() {
            let tx = self.tx.clone().expect("ChannelSink used after close");
            let chunk = Bytes::copy_from_slice(buf);
            let len = buf.len();
            self.pending = Some(Box::pin(async move { tx.send(Ok(chunk)).await.map_err(|_| len) }));
        }
        let result = self.pending.as_mut().unwrap().as_mut().poll(cx);
        match result {
            std::task::Poll::Ready(Ok(())) => {
                let len = buf.len();
                self.pending = None;
                std::task::Poll::Ready(Ok(len))
            }
            std::task::Poll::Ready(Err(_)) => {
                self.pending = None;
                std::task::Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "response receiver dropped")))
            }
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }

    fn poll_flush(self: std::pin::Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: std::pin::Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_leftmost_label() {
        assert_eq!(extract_subdomain("foo.broker.test"), Some("foo"));
        assert_eq!(extract_subdomain("foo.broker.test:8080"), Some("foo"));
    }

    #[test]
    fn rejects_host_without_a_dot() {
        assert_eq!(extract_subdomain("localhost"), None);
        assert_eq!(extract_subdomain("localhost:8080"), None);
    }

    #[test]
    fn rejects_empty_host() {
        assert_eq!(extract_subdomain(""), None);
    }
}
