//! Peer directory.
//!
//! A bidirectional identifier ⇄ endpoint map with freshness timestamps and
//! an optional session nonce per entry. The session nonce is chosen once
//! per run of a node; seeing a different nonce for a known identifier
//! means the owner restarted, so every piece of state that depends on the
//! old incarnation must go.
//!
//! The directory also keeps a short-lived blacklist of identifiers that
//! recently failed to answer; lookups skip them instead of burning another
//! query timeout on a dead peer.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ahash::{HashMap, HashMapExt};

use codec::id::NodeId;

/// Blacklist residence time for an unresponsive peer.
pub const TIMEOUT_TTL: Duration = Duration::from_secs(30);

/// Entries untouched for this long are dropped by the sweep.
pub const MAP_TTL: Duration = Duration::from_secs(300);

/// Base interval of the jittered sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
struct Entry {
    addr: SocketAddr,
    session: Option<u32>,
    last_seen: Instant,
}

#[derive(Debug, Default)]
pub struct Peers {
    by_id: HashMap<NodeId, Entry>,
    by_addr: HashMap<SocketAddr, NodeId>,
    timed_out: HashMap<NodeId, Instant>,
}

impl Peers {
    pub fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            by_addr: HashMap::new(),
            timed_out: HashMap::new(),
        }
    }

    pub fn get_by_id(&self, id: &NodeId) -> Option<SocketAddr> {
        self.by_id.get(id).map(|e| e.addr)
    }

    pub fn get_by_addr(&self, addr: &SocketAddr) -> Option<NodeId> {
        self.by_addr.get(addr).copied()
    }

    pub fn session_of(&self, id: &NodeId) -> Option<u32> {
        self.by_id.get(id).and_then(|e| e.session)
    }

    /// Upsert without session information.
    ///
    /// Returns `true` when the entry was new or its endpoint changed.
    pub fn add(&mut self, now: Instant, id: NodeId, addr: SocketAddr) -> bool {
        self.insert(now, id, addr, None)
    }

    /// Upsert with a session nonce.
    ///
    /// Returns `true` when the peer is a different incarnation than the
    /// one on file (the caller must purge dependent state, e.g. the
    /// k-bucket entries of the stale identifier).
    pub fn add_with_session(
        &mut self,
        now: Instant,
        id: NodeId,
        addr: SocketAddr,
        session: u32,
    ) -> bool {
        let restarted = matches!(
            self.by_id.get(&id),
            Some(Entry {
                session: Some(old), ..
            }) if *old != session
        );

        if restarted {
            self.remove(&id);
        }

        self.insert(now, id, addr, Some(session));
        restarted
    }

    fn insert(&mut self, now: Instant, id: NodeId, addr: SocketAddr, session: Option<u32>) -> bool {
        // one entry per endpoint: evict whoever held this address before
        if let Some(old_id) = self.by_addr.get(&addr).copied() {
            if old_id != id {
                self.by_id.remove(&old_id);
            }
        }

        let mut changed = true;
        let mut session = session;
        if let Some(old) = self.by_id.get(&id) {
            changed = old.addr != addr;
            session = session.or(old.session);
            if changed {
                self.by_addr.remove(&old.addr);
            }
        }

        self.by_addr.insert(addr, id);
        self.by_id.insert(
            id,
            Entry {
                addr,
                session,
                last_seen: now,
            },
        );

        changed
    }

    pub fn remove(&mut self, id: &NodeId) {
        if let Some(entry) = self.by_id.remove(id) {
            self.by_addr.remove(&entry.addr);
        }
    }

    pub fn refresh(&mut self, now: Instant, id: &NodeId) {
        if let Some(entry) = self.by_id.get_mut(id) {
            entry.last_seen = now;
        }
    }

    /// Stamp `id` into the short-term blacklist.
    pub fn mark_timeout(&mut self, now: Instant, id: NodeId) {
        self.timed_out.insert(id, now);
    }

    pub fn is_timed_out(&self, id: &NodeId) -> bool {
        self.timed_out.contains_key(id)
    }

    /// Drop stale entries and expired blacklist stamps.
    pub fn sweep(&mut self, now: Instant) {
        let stale: Vec<NodeId> = self
            .by_id
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_seen) > MAP_TTL)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            self.remove(&id);
        }

        self.timed_out
            .retain(|_, at| now.duration_since(*at) <= TIMEOUT_TTL);
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
