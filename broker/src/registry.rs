//! The subdomain → session registry. The only shared mutable state in the
//! broker core; every other concurrency-visible datum lives inside a
//! [`Session`].
//!
//! Registration is split into two phases because the handshake has to
//! decide its HTTP response (`101` vs `409`) before the socket is even
//! hijacked — hyper's upgrade mechanism only hands over the raw socket
//! *after* a `101` response has been sent, so that decision can't wait
//! until the session actually exists. [`Registry::reserve`] claims the
//! subdomain up front; [`Registry::activate`] backfills the real session
//! once the hijack completes.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict;

enum Slot {
    /// Subdomain claimed by an in-flight registration; no session exists
    /// yet and the ingress dispatcher must treat this as not-found.
    Reserved,
    Active(Arc<Session>),
}

#[derive(Clone)]
pub struct Registry {
    slots: Arc<DashMap<String, Slot>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
        }
    }

    /// Atomically claims `subdomain` for an in-progress registration.
    /// Fails with [`Conflict`] if the subdomain is already reserved or
    /// bound to a live session.
    pub fn reserve(&self, subdomain: String) -> Result<(), Conflict> {
        match self.slots.entry(subdomain) {
            Entry::Occupied(_) => Err(Conflict),
            Entry::Vacant(slot) => {
                slot.insert(Slot::Reserved);
                Ok(())
            }
        }
    }

    /// Backfills a reservation with the now-hijacked session. Only the
    /// task that won [`Registry::reserve`] for this subdomain may call
    /// this, so there is no concurrent writer to race against.
    pub fn activate(&self, subdomain: String, session: Arc<Session>) {
        self.slots.insert(subdomain, Slot::Active(session));
    }

    /// Releases a reservation that never turned into a live session
    /// (hijack failed, or the handshake write failed).
    pub fn release_reservation(&self, subdomain: &str) {
        self.slots.remove_if(subdomain, |_, slot| matches!(slot, Slot::Reserved));
    }

    /// Looks up a live session by subdomain. A merely-reserved subdomain
    /// is treated the same as absent.
    pub fn lookup(&self, subdomain: &str) -> Option<Arc<Session>> {
        match self.slots.get(subdomain).map(|entry| match entry.value() {
            Slot::Active(session) => Some(session.clone()),
            Slot::Reserved => None,
        }) {
            Some(inner) => inner,
            None => None,
        }
    }

    /// Whether `subdomain` is still bound to exactly this session. Used by
    /// the liveness watcher to notice it's been superseded (e.g. by a
    /// WebSocket bridge tearing the session down once it exits, since the
    /// session can never return to HTTP mode after that) without waiting
    /// for its own EOF poll to catch up.
    pub fn contains(&self, subdomain: &str, session: &Arc<Session>) -> bool {
        matches!(self.slots.get(subdomain).as_deref(), Some(Slot::Active(stored)) if Arc::ptr_eq(stored, session))
    }

    /// Removes the mapping for `subdomain` iff the stored session is the
    /// same one the caller holds, so a late unbind from a stale session
    /// can't evict a newer registration. Idempotent: a second call is a
    /// no-op.
    pub fn unbind(&self, subdomain: &str, session: &Arc<Session>) {
        self.slots.remove_if(subdomain, |_, slot| match slot {
            Slot::Active(stored) => Arc::ptr_eq(stored, session),
            Slot::Reserved => false,
        });
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split, BufReader, BufWriter};

    fn fake_session(subdomain: &str) -> Arc<Session> {
        let (a, _b) = duplex(64);
        let (r, w) = split(a);
        Session::new(subdomain.to_string(), BufReader::new(Box::new(r)), BufWriter::new(Box::new(w)))
    }

    #[test]
    fn reserve_rejects_second_reservation_with_conflict() {
        let registry = Registry::new();
        assert!(registry.reserve("foo".into()).is_ok());
        assert_eq!(registry.reserve("foo".into()), Err(Conflict));
    }

    #[test]
    fn reserve_rejects_against_an_active_session_too() {
        let registry = Registry::new();
        registry.reserve("foo".into()).unwrap();
        registry.activate("foo".into(), fake_session("foo"));
        assert_eq!(registry.reserve("foo".into()), Err(Conflict));
    }

    #[test]
    fn lookup_hides_reserved_but_not_yet_active_sessions() {
        let registry = Registry::new();
        registry.reserve("foo".into()).unwrap();
        assert!(registry.lookup("foo").is_none());
        registry.activate("foo".into(), fake_session("foo"));
        assert!(registry.lookup("foo").is_some());
    }

    #[test]
    fn release_reservation_frees_the_subdomain_for_retry() {
        let registry = Registry::new();
        registry.reserve("foo".into()).unwrap();
        registry.release_reservation("foo");
        assert!(registry.reserve("foo".into()).is_ok());
    }

    #[test]
    fn unbind_is_idempotent_and_ignores_stale_identity() {
        let registry = Registry::new();
        let s1 = fake_session("foo");
        registry.reserve("foo".into()).unwrap();
        registry.activate("foo".into(), s1.clone());

        registry.unbind("foo", &s1);
        assert!(registry.lookup("foo").is_none());
        // Second call is a no-op.
        registry.unbind("foo", &s1);

        let s2 = fake_session("foo");
        registry.reserve("foo".into()).unwrap();
        registry.activate("foo".into(), s2.clone());
        // A stale unbind of s1 must not evict s2.
        registry.unbind("foo", &s1);
        assert!(registry.lookup("foo").is_some());
    }
}
