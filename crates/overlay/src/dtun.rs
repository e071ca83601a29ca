//! DTUN: the rendezvous realm.
//!
//! A second Kademlia instance whose *value* is "how to reach this
//! identifier right now". Globally reachable nodes serve as registrars;
//! every node — NATed ones above all — periodically registers its current
//! endpoint with the registrars closest to its own identifier, so a
//! find-value on a node identifier converges on somebody who knows where
//! it lives.
//!
//! `request` additionally makes the registrar poke the registrant
//! (`request-by`) with the requester's endpoint, which opens the
//! registrant's NAT toward the requester before the requester's first
//! real packet arrives.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ahash::{HashMap, HashMapExt};
use bytes::BytesMut;
use rand::Rng;

use codec::id::NodeId;
use codec::messages::{
    DtunFindValueReply, FindNode, FindNodeReply, NodeRecord, PlainNonce, Register, Request,
    RequestBy,
};
use codec::{Header, MsgType, STATE_GLOBAL};

use crate::lookup::{LookupGoal, LookupKind};
use crate::node::{records_to_nodes, NodeState};
use crate::routing::{RoutingTable, K};
use crate::timer::Timeout;
use crate::{NodeAddr, Realm};

/// Cadence of registration refreshes.
pub const REGISTER_INTERVAL: Duration = Duration::from_secs(10);

/// Registrations older than this are dead.
pub const REGISTERED_TTL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy)]
pub struct Registered {
    pub addr: SocketAddr,
    pub session: u32,
    pub at: Instant,
}

#[derive(Debug)]
pub struct Dtun {
    pub table: RoutingTable,
    registered: HashMap<NodeId, Registered>,
    registering: bool,
}

impl Dtun {
    pub fn new() -> Self {
        Self {
            table: RoutingTable::new(Realm::Dtun),
            registered: HashMap::new(),
            registering: false,
        }
    }

    /// A live registration for `id`, if any.
    pub fn registration(&self, now: Instant, id: &NodeId) -> Option<Registered> {
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

impl Default for Dtun {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeState {
    pub(crate) fn recv_dtun_ping(&mut self, now: Instant, hdr: &Header, body: &[u8], from: SocketAddr) {
        let Ok(ping) = PlainNonce::decode(body) else {
            return;
        };

        self.peers.add(now, hdr.src, from);

        let mut buf = BytesMut::new();
        PlainNonce { nonce: ping.nonce }.encode(
            MsgType::DtunPingReply,
            &self.id,
            &hdr.src,
            &mut buf,
        );
        self.outbox.push(from, buf.freeze());
    }

    pub(crate) fn recv_dtun_ping_reply(
        &mut self,
        now: Instant,
        hdr: &Header,
        body: &[u8],
        from: SocketAddr,
    ) {
        let Ok(reply) = PlainNonce::decode(body) else {
            return;
        };

        self.peers.add(now, hdr.src, from);
        self.dtun
            .table
            .on_ping_reply(reply.nonce, &hdr.src, from, &mut self.timers);
    }

    pub(crate) fn recv_dtun_find_node(
        &mut self,
        now: Instant,
        hdr: &Header,
        body: &[u8],
        from: SocketAddr,
    ) {
        let Ok(msg) = FindNode::decode(body) else {
            return;
        };

        self.peers.add(now, hdr.src, from);

        // only globally reachable nodes are useful routing hops
        if msg.state == STATE_GLOBAL {
            self.offer_to_table(now, Realm::Dtun, hdr.src, from);
        }

        let nodes = self.dtun.table.lookup(&self.id, &msg.target, K);
        let mut buf = BytesMut::new();
        FindNodeReply {
            nonce: msg.nonce,
            target: msg.target,
            family: self.family,
            nodes: self.nodes_to_records(&nodes),
        }
        .encode(MsgType::DtunFindNodeReply, &self.id, &hdr.src, &mut buf);
        self.outbox.push(from, buf.freeze());
    }

    pub(crate) fn recv_dtun_find_node_reply(
        &mut self,
        now: Instant,
        hdr: &Header,
        body: &[u8],
        from: SocketAddr,
    ) {
        let Ok(msg) = FindNodeReply::decode(body) else {
            return;
        };

        self.peers.add(now, hdr.src, from);
        self.offer_to_table(now, Realm::Dtun, hdr.src, from);

        let nodes = records_to_nodes(&msg.nodes, from, &hdr.src);
        self.lookup_nodes_received(now, msg.nonce, &hdr.src, nodes);
    }

    pub(crate) fn recv_dtun_find_value(
        &mut self,
        now: Instant,
        hdr: &Header,
        body: &[u8],
        from: SocketAddr,
    ) {
        let Ok(msg) = FindNode::decode(body) else {
            return;
        };

        self.peers.add(now, hdr.src, from);
        if msg.state == STATE_GLOBAL {
            self.offer_to_table(now, Realm::Dtun, hdr.src, from);
        }

        // a proxied registrant is reachable through us: answer with the
        // sender sentinel so the requester routes its traffic here
        let value = if self.proxy.registration(now, &msg.target).is_some() {
            Some(NodeRecord {
                id: msg.target,
                addr: None,
            })
        } else {
            self.dtun.registration(now, &msg.target).map(|r| NodeRecord {
                id: msg.target,
                addr: Some(r.addr),
            })
        };

        let nodes = match value {
            Some(_) => Vec::new(),
            None => self.dtun.table.lookup(&self.id, &msg.target, K),
        };

        let mut buf = BytesMut::new();
        DtunFindValueReply {
            nonce: msg.nonce,
            target: msg.target,
            family: self.family,
            value,
            nodes: self.nodes_to_records(&nodes),
        }
        .encode(&self.id, &hdr.src, &mut buf);
        self.outbox.push(from, buf.freeze());
    }

    pub(crate) fn recv_dtun_find_value_reply(
        &mut self,
        now: Instant,
        hdr: &Header,
        body: &[u8],
        from: SocketAddr,
    ) {
        let Ok(msg) = DtunFindValueReply::decode(body) else {
            return;
        };

        self.peers.add(now, hdr.src, from);
        self.offer_to_table(now, Realm::Dtun, hdr.src, from);

        if let Some(value) = msg.value {
            let endpoint = NodeAddr {
                id: value.id,
                addr: Some(value.addr.unwrap_or(from)),
            };
            self.lookup_endpoint_received(now, msg.nonce, &hdr.src, from, endpoint);
        } else {
            let nodes = records_to_nodes(&msg.nodes, from, &hdr.src);
            self.lookup_nodes_received(now, msg.nonce, &hdr.src, nodes);
        }
    }

    pub(crate) fn recv_dtun_register(
        &mut self,
        now: Instant,
        hdr: &Header,
        body: &[u8],
        from: SocketAddr,
    ) {
        let Ok(msg) = Register::decode(body) else {
            return;
        };

        let restarted = self.peers.add_with_session(now, hdr.src, from, msg.session);
        if restarted {
            self.forget_restarted_peer(&hdr.src);
        }

        self.dtun.registered.insert(
            hdr.src,
            Registered {
                addr: from,
                session: msg.session,
                at: now,
            },
        );
        log::debug!("[dtun] registered {} at {}", hdr.src, from);
    }

    pub(crate) fn recv_dtun_request(
        &mut self,
        now: Instant,
        hdr: &Header,
        body: &[u8],
        from: SocketAddr,
    ) {
        let Ok(msg) = Request::decode(body) else {
            return;
        };

        let Some(reg) = self.dtun.registration(now, &msg.target) else {
            return;
        };

        let mut buf = BytesMut::new();
        PlainNonce { nonce: msg.nonce }.encode(
            MsgType::DtunRequestReply,
            &self.id,
            &hdr.src,
            &mut buf,
        );
        self.outbox.push(from, buf.freeze());

        // poke the registrant so its NAT opens toward the requester
        let mut buf = BytesMut::new();
        RequestBy {
            nonce: msg.nonce,
            requester: from,
        }
        .encode(&self.id, &msg.target, &mut buf);
        self.outbox.push(reg.addr, buf.freeze());
    }

    pub(crate) fn recv_dtun_request_by(&mut self, body: &[u8]) {
        let Ok(msg) = RequestBy::decode(body) else {
            return;
        };

        // any datagram sent now opens our NAT mapping toward the
        // requester; a ping also lets them learn our identifier
        let nonce: u32 = rand::rng().random();
        let mut buf = BytesMut::new();
        PlainNonce { nonce }.encode(MsgType::DtunPing, &self.id, &NodeId::ZERO, &mut buf);
        self.outbox.push(msg.requester, buf.freeze());
    }

    pub(crate) fn recv_dtun_request_reply(&mut self, now: Instant, hdr: &Header, from: SocketAddr) {
        // the rendezvous answer itself travels in the find-value reply;
        // this only confirms the registrar relayed our request
        self.peers.refresh(now, &hdr.src);
        let _ = from;
    }

    /// Re-announce our endpoint to the registrars closest to us.
    pub(crate) fn dtun_register(&mut self, now: Instant) {
        if self.dtun.registering || self.dtun.table.is_empty() {
            return;
        }

        self.dtun.registering = true;
        self.start_lookup(
            now,
            Realm::Dtun,
            LookupKind::FindNode,
            self.id,
            LookupGoal::DtunRegister,
        );
    }

    /// Continuation of [`dtun_register`]: the closest nodes are known.
    pub(crate) fn dtun_register_finished(&mut self, nodes: &[NodeAddr]) {
        self.dtun.registering = false;

        for node in nodes.iter().take(K) {
            let Some(addr) = node.addr else {
                continue;
            };
            if node.id == self.id {
                continue;
            }

            let mut buf = BytesMut::new();
            Register {
                session: self.session,
            }
            .encode(&self.id, &node.id, &mut buf);
            self.outbox.push(addr, buf.freeze());
        }
    }

    pub(crate) fn on_dtun_register_tick(&mut self, now: Instant) {
        self.dtun_register(now);
        self.timers
            .schedule(now + REGISTER_INTERVAL, Timeout::DtunRegister);
    }

    /// Resolve `target` to its current endpoint and ask its registrar to
    /// hole-punch it toward us. The outcome lands in
    /// [`LookupGoal::Resolve`] dispatch.
    pub(crate) fn dtun_request(&mut self, now: Instant, target: NodeId) {
        self.start_lookup(
            now,
            Realm::Dtun,
            LookupKind::FindValue { key: None },
            target,
            LookupGoal::Resolve { target },
        );
    }

    /// After a find-value produced an endpoint, ask the responder to
    /// relay a request-by toward the target.
    pub(crate) fn send_dtun_request(&mut self, registrar: SocketAddr, registrar_id: &NodeId, target: NodeId) {
        let nonce: u32 = rand::rng().random();
        let mut buf = BytesMut::new();
        Request { nonce, target }.encode(&self.id, registrar_id, &mut buf);
        self.outbox.push(registrar, buf.freeze());
    }
}
