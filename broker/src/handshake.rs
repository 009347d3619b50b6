//! The registration handshake: `GET /_tunnel?subdomain=<s>`.
//!
//! This hijacks the underlying socket away from the HTTP server so no
//! further HTTP parsing happens on it, then either publishes a new
//! session under the requested subdomain or tears the socket down if the
//! subdomain turned out to be already bound.
//!
//! hyper hands over the raw socket as the consequence of this handler
//! returning a `101` response carrying `Upgrade`/`Connection` headers:
//! once that response has gone out, hyper resolves the request's
//! `OnUpgrade` future with the raw stream, the same mechanism axum's own
//! WebSocket upgrade uses, just triggered here without the agent ever
//! sending `Upgrade` headers of its own. Because that response commits
//! the connection before the socket is even hijacked, the conflict
//! decision can't wait until a session exists — [`Registry::reserve`]
//! claims the subdomain synchronously, before this handler decides which
//! response to send at all.

use std::collections::HashMap;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{split, AsyncWriteExt, BufReader, BufWriter};
use tracing::{error, info, warn};

use crate::context::AppState;
use crate::liveness;
use crate::session::Session;

pub async fn register(State(state): State<AppState>, Query(params): Query<HashMap<String, String>>, mut req: Request<Body>) -> Response {
    let subdomain = match params.get("subdomain").map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
        Some(s) => s,
        None => {
            warn!("registration rejected: missing or empty subdomain");
            return (StatusCode::BAD_REQUEST, "missing or empty subdomain\n").into_response();
        }
    };

    if state.registry.reserve(subdomain.clone()).is_err() {
        warn!(subdomain = %subdomain, "registration rejected: subdomain already bound");
        return (StatusCode::CONFLICT, format!("subdomain {subdomain:?} is already bound\n")).into_response();
    }

    let on_upgrade = hyper::upgrade::on(&mut req);
    let registry = state.registry.clone();
    let subdomain_for_task = subdomain.clone();

    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(u) => u,
            Err(e) => {
                error!(subdomain = %subdomain_for_task, error = %e, "hijack upgrade failed");
                registry.release_reservation(&subdomain_for_task);
                return;
            }
        };

        let io = TokioIo::new(upgraded);
        let (read_half, write_half) = split(io);
        let session = Session::new(
            subdomain_for_task.clone(),
            BufReader::new(Box::new(read_half)),
            BufWriter::new(Box::new(write_half)),
        );

        let mut writer = session.writer.lock().await;
        let write_result = async {
            writer
                .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
                .await?;
            writer.flush().await
        }
        .await;
        drop(writer);

        match write_result {
            Ok(()) => {
                registry.activate(subdomain_for_task.clone(), session.clone());
                info!(subdomain = %subdomain_for_task, "session registered");
                liveness::spawn_watcher(registry, session);
            }
            Err(e) => {
                error!(subdomain = %subdomain_for_task, error = %e, "writing handshake response failed");
                registry.release_reservation(&subdomain_for_task);
            }
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .body(Body::empty())
        .unwrap()
}
