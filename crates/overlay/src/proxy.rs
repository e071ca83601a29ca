//! Proxy registration and relay.
//!
//! A symmetric NAT allocates a fresh external endpoint per destination,
//! so nothing unsolicited ever gets in: such a node picks the globally
//! reachable node closest to its own identifier and keeps a registration
//! alive there. The proxy then
//!
//! - answers rendezvous queries for the registrant with *its own*
//!   endpoint (see the DTUN find-value path), pulling the registrant's
//!   traffic here,
//! - relays datagram and stream frames addressed to the registrant,
//!   rewriting only the UDP destination, and
//! - runs DHT puts and gets on the registrant's behalf (`proxy-store` /
//!   `proxy-get`), since the registrant cannot reach the replica set
//!   directly.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ahash::{HashMap, HashMapExt};
use bytes::BytesMut;
use rand::Rng;

use codec::id::NodeId;
use codec::messages::{ProxyGet, ProxyGetReply, ProxyRegister, Store};
use codec::{Header, MsgType};

use crate::lookup::{LookupGoal, LookupKind};
use crate::nat::NatState;
use crate::node::NodeState;
use crate::timer::Timeout;
use crate::{NodeAddr, NodeEvent, Realm};

/// Client-side re-registration cadence; also the NAT keep-alive.
pub const REGISTER_INTERVAL: Duration = Duration::from_secs(5);

/// A registration attempt may be retried after this.
pub const REGISTER_GUARD: Duration = Duration::from_secs(2);

/// Server-side registration lifetime.
pub const REGISTERED_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct Registration {
    pub addr: SocketAddr,
    pub session: u32,
    pub at: Instant,
}

#[derive(Debug)]
pub struct Proxy {
    /// Registrants we relay for.
    registered: HashMap<NodeId, Registration>,
    /// Our own registration session, drawn once per run.
    session: u32,
    registering: bool,
    /// The proxy we registered with, once picked.
    pub my_proxy: Option<NodeAddr>,
    /// Proxied gets we are waiting on, nonce → user operation.
    pending_gets: HashMap<u32, u64>,
}

impl Proxy {
    pub fn new() -> Self {
        Self {
            registered: HashMap::new(),
            session: rand::rng().random(),
            registering: false,
            my_proxy: None,
            pending_gets: HashMap::new(),
        }
    }

    /// A live registration for `id`, if any.
    pub fn registration(&self, now: Instant, id: &NodeId) -> Option<Registration> {
        self.registered
            .get(id)
            .filter(|r| now.duration_since(r.at) <= REGISTERED_TTL)
            .copied()
    }

    pub fn sweep(&mut self, now: Instant) {
        self.registered
            .retain(|_, r| now.duration_since(r.at) <= REGISTERED_TTL);
    }
}

impl Default for Proxy {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeState {
    /// Find the closest globally reachable node and register with it.
    pub(crate) fn proxy_register(&mut self, now: Instant) {
        if self.proxy.registering {
            return;
        }

        self.proxy.registering = true;
        let nonce: u32 = rand::rng().random();
        self.timers.schedule(
            now + REGISTER_GUARD,
            Timeout::ProxyRegisterGuard { nonce },
        );

        self.start_lookup(
            now,
            Realm::Dtun,
            LookupKind::FindNode,
            self.id,
            LookupGoal::ProxyRegister,
        );
    }

    /// Continuation of [`proxy_register`]: pick the first reachable
    /// candidate as our proxy.
    pub(crate) fn proxy_register_finished(&mut self, nodes: &[NodeAddr]) {
        for node in nodes {
            let Some(addr) = node.addr else {
                continue;
            };
            if node.id == self.id {
                continue;
            }

            let mut buf = BytesMut::new();
            ProxyRegister {
                session: self.proxy.session,
                nonce: rand::rng().random(),
            }
            .encode(&self.id, &node.id, &mut buf);
            self.outbox.push(addr, buf.freeze());

            self.proxy.my_proxy = Some(*node);
            log::debug!("[proxy] registering with {}", node.id);
            break;
        }
    }

    pub(crate) fn on_proxy_register_guard(&mut self, _nonce: u32) {
        self.proxy.registering = false;
    }

    pub(crate) fn on_proxy_register_tick(&mut self, now: Instant) {
        if self.nat.state == NatState::SymmetricNat {
            self.proxy_register(now);
        }
        self.timers
            .schedule(now + REGISTER_INTERVAL, Timeout::ProxyRegister);
    }

    pub(crate) fn recv_proxy_register(
        &mut self,
        now: Instant,
        hdr: &Header,
        body: &[u8],
        from: SocketAddr,
    ) {
        let Ok(msg) = ProxyRegister::decode(body) else {
            return;
        };

        let restarted = self.peers.add_with_session(now, hdr.src, from, msg.session);
        if restarted {
            self.forget_restarted_peer(&hdr.src);
        }

        self.proxy.registered.insert(
            hdr.src,
            Registration {
                addr: from,
                session: msg.session,
                at: now,
            },
        );
        log::debug!("[proxy] holding registration for {}", hdr.src);
    }

    /// Relay a frame addressed to a registrant. Returns true when the
    /// frame was forwarded.
    pub(crate) fn proxy_relay(&mut self, now: Instant, dst: &NodeId, datagram: &[u8]) -> bool {
        let Some(reg) = self.proxy.registration(now, dst) else {
            return false;
        };

        self.outbox
            .push(reg.addr, bytes::Bytes::copy_from_slice(datagram));
        true
    }

    /// A registrant asked us to store on its behalf.
    pub(crate) fn recv_proxy_store(&mut self, now: Instant, hdr: &Header, body: &[u8]) {
        let Ok(msg) = Store::decode(body) else {
            return;
        };
        if self.proxy.registration(now, &hdr.src).is_none() {
            return;
        }

        self.dht_put(now, msg.key, msg.value, msg.ttl, msg.unique, hdr.src);
    }

    /// A registrant asked us to fetch on its behalf.
    pub(crate) fn recv_proxy_get(&mut self, now: Instant, hdr: &Header, body: &[u8]) {
        let Ok(msg) = ProxyGet::decode(body) else {
            return;
        };
        if self.proxy.registration(now, &hdr.src).is_none() {
            return;
        }

        self.dht_get(
            now,
            msg.key,
            LookupGoal::ProxiedGet {
                nonce: msg.nonce,
                requester: hdr.src,
            },
        );
    }

    /// Continuation of [`recv_proxy_get`]: ship the answer back.
    pub(crate) fn proxied_get_finished(
        &mut self,
        now: Instant,
        nonce: u32,
        requester: NodeId,
        values: Option<Vec<bytes::Bytes>>,
    ) {
        let Some(reg) = self.proxy.registration(now, &requester) else {
            return;
        };

        let mut buf = BytesMut::new();
        ProxyGetReply { nonce, values }.encode(&self.id, &requester, &mut buf);
        self.outbox.push(reg.addr, buf.freeze());
    }

    /// Client side: run a put through our proxy.
    pub(crate) fn put_via_proxy(
        &mut self,
        key: bytes::Bytes,
        value: bytes::Bytes,
        ttl: u16,
        unique: bool,
    ) -> bool {
        let Some(proxy) = self.proxy.my_proxy else {
            return false;
        };
        let Some(addr) = proxy.addr else {
            return false;
        };

        let mut buf = BytesMut::new();
        Store {
            target: NodeId::sha1(&key),
            ttl,
            unique,
            key,
            value,
        }
        .encode(MsgType::ProxyStore, &self.id, &proxy.id, &mut buf);
        self.outbox.push(addr, buf.freeze());
        true
    }

    /// Client side: run a get through our proxy.
    pub(crate) fn get_via_proxy(&mut self, key: bytes::Bytes, op: u64) -> bool {
        let Some(proxy) = self.proxy.my_proxy else {
            return false;
        };
        let Some(addr) = proxy.addr else {
            return false;
        };

        let nonce = {
            let mut rng = rand::rng();
            loop {
                let nonce: u32 = rng.random();
                if !self.proxy.pending_gets.contains_key(&nonce) {
                    break nonce;
                }
            }
        };
        self.proxy.pending_gets.insert(nonce, op);

        let mut buf = BytesMut::new();
        ProxyGet {
            nonce,
            target: NodeId::sha1(&key),
            key,
        }
        .encode(&self.id, &proxy.id, &mut buf);
        self.outbox.push(addr, buf.freeze());
        true
    }

    pub(crate) fn recv_proxy_get_reply(&mut self, body: &[u8]) {
        let Ok(msg) = ProxyGetReply::decode(body) else {
            return;
        };

        let Some(op) = self.proxy.pending_gets.remove(&msg.nonce) else {
            return;
        };
        self.events.push(NodeEvent::GetDone {
            op,
            values: msg.values,
        });
    }
}
