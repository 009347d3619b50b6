//! The state attached to one hijacked session socket shared with an agent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::sync::Mutex;

/// Boxed so a session can be built over whatever stream hijacking actually
/// produced (the hyper-upgraded socket in production, a `tokio::io::duplex`
/// half in tests) without threading a generic parameter through the
/// registry and every handler that touches a session.
pub type SessionReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
pub type SessionWriter = BufWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// One agent's hijacked socket and everything that guards access to it.
///
/// The buffered reader and writer are created exactly once, at hijack
/// time, and never recreated: any bytes the reader already pulled off the
/// raw socket belong to the session, not to a fresh wrapper around it.
pub struct Session {
    subdomain: String,
    pub reader: Mutex<SessionReader>,
    pub writer: Mutex<SessionWriter>,
    /// Free/busy interlock serializing HTTP exchanges (§4.1/§5). A
    /// successful compare-and-swap is the only way to claim it.
    in_use: AtomicBool,
}

impl Session {
    pub fn new(subdomain: String, reader: SessionReader, writer: SessionWriter) -> Arc<Self> {
        Arc::new(Self {
            subdomain,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            in_use: AtomicBool::new(false),
        })
    }

    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    /// Atomically claims exclusive use of the session. Returns `true` if
    /// this caller won the claim and must call [`Session::release`] when
    /// the exchange completes.
    pub fn try_claim(&self) -> bool {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.in_use.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("subdomain", &self.subdomain).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split};

    fn fake_session(subdomain: &str) -> Arc<Session> {
        let (a, _b) = duplex(64);
        let (r, w) = split(a);
        Session::new(subdomain.to_string(), BufReader::new(Box::new(r)), BufWriter::new(Box::new(w)))
    }

    #[test]
    fn try_claim_excludes_a_second_concurrent_claim() {
        let session = fake_session("alice");

        assert!(session.try_claim());
        assert!(!session.try_claim(), "a session already claimed must reject a second claim");

        session.release();
        assert!(session.try_claim(), "releasing must free the session for a subsequent claim");
    }

    #[test]
    fn release_without_a_prior_claim_is_harmless() {
        let session = fake_session("bob");
        session.release();
        assert!(session.try_claim());
    }
}
