//! Background liveness watcher. One is spawned per session once
//! registration completes; it exits exactly once, and only by unbinding
//! the session it watches.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncBufReadExt;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::registry::Registry;
use crate::session::Session;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const POLL_DEADLINE: Duration = Duration::from_secs(1);

pub fn spawn_watcher(registry: Registry, session: Arc<Session>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            if !registry.contains(session.subdomain(), &session) {
                // Superseded by something else tearing the session down
                // directly (most commonly the WebSocket bridge, which
                // always ends the session once it exits).
                return;
            }

            let mut reader = session.reader.lock().await;
            match timeout(POLL_DEADLINE, reader.fill_buf()).await {
                Ok(Ok(buf)) if buf.is_empty() => {
                    drop(reader);
                    info!(subdomain = session.subdomain(), "liveness check observed EOF, unbinding");
                    registry.unbind(session.subdomain(), &session);
                    return;
                }
                Ok(Ok(_)) => {
                    // Bytes arrived while idle; leave them buffered for
                    // whichever dispatcher or pump reads next.
                }
                Ok(Err(e)) => {
                    drop(reader);
                    warn!(subdomain = session.subdomain(), error = %e, "liveness check failed, unbinding");
                    registry.unbind(session.subdomain(), &session);
                    return;
                }
                Err(_elapsed) => {
                    // No data within the deadline. Benign; keep polling.
                }
            }
        }
    });
}
