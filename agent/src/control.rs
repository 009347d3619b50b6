//! The agent's control loop (§4.4): reads HTTP/1.1 requests off the
//! session in a loop, each one an external ingress request the broker
//! delivered, and either forwards it to the local service or, for a
//! WebSocket upgrade, hands the session off to the bridge for the rest
//! of its life.

use tracing::{error, info};

use tunnel_wire::read_request_head;

use crate::bridge;
use crate::forward;
use crate::session::Session;

fn is_websocket_upgrade(headers: &http::HeaderMap) -> bool {
    let connection_has_upgrade = headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    let upgrade_is_websocket = headers
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    connection_has_upgrade && upgrade_is_websocket
}

/// Drives the session until the broker closes it or hands off into the
/// WebSocket bridge (which never returns control here, since the session
/// can't go back to HTTP mode afterward).
pub async fn run(client: reqwest::Client, local_port: u16, mut session: Session) {
    loop {
        let head = match read_request_head(&mut session.reader).await {
            Ok(head) => head,
            Err(e) => {
                info!(error = %e, "session closed");
                return;
            }
        };

        if is_websocket_upgrade(&head.headers) {
            info!(path = %head.uri, "entering websocket bridge");
            if let Err(e) = bridge::run(local_port, session, head).await {
                error!(error = %e, "websocket bridge failed");
            }
            return;
        }

        if let Err(e) = forward::forward_request(&client, local_port, &mut session, head).await {
            error!(error = %e, "forwarding request failed");
            return;
        }
    }
}
