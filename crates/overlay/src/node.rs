//! The node: every engine composed into one state machine.
//!
//! `NodeState` owns the engines, the timer wheel and the outbound
//! queues; nothing in here touches a socket. The driver calls exactly
//! three kinds of entry points — [`NodeState::handle_datagram`],
//! [`NodeState::run_due`] and the user-facing operations — and between
//! calls drains the outbox, the event queue and the driver commands.
//! Engines never hold references to each other; every cross-engine
//! effect is a method on this type, which keeps the whole core free of
//! reference cycles and locks.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use rand::Rng;

use codec::id::NodeId;
use codec::messages::{NodeRecord, PlainNonce};
use codec::{Family, Header, MsgType};

use crate::advertise::Advertiser;
use crate::dgram::DgramQueues;
use crate::dht::Dht;
use crate::dtun::Dtun;
use crate::lookup::{LookupGoal, LookupKind, LookupResult, Lookups, Query};
use crate::nat::{Nat, NatState};
use crate::outbox::Outbox;
use crate::peers::{Peers, SWEEP_INTERVAL};
use crate::proxy::Proxy;
use crate::rdp::{Rdp, RdpState, TICK};
use crate::routing::RoutingTable;
use crate::timer::{Timeout, Timers};
use crate::{NodeAddr, NodeEvent, Realm};

/// Things only the driver can do for the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverCmd {
    /// Bind a short-lived probe socket for the NAT redirect check; the
    /// driver answers through [`NodeState::probe_opened`] and
    /// [`NodeState::probe_outcome`].
    OpenProbe { nonce: u32 },
}

/// Substitute the sender for sentinel records in a received node list.
pub(crate) fn records_to_nodes(
    records: &[NodeRecord],
    from: SocketAddr,
    src: &NodeId,
) -> Vec<NodeAddr> {
    records
        .iter()
        .map(|rec| match rec.addr {
            Some(addr) => NodeAddr {
                id: rec.id,
                addr: Some(addr),
            },
            None => NodeAddr {
                id: if rec.id.is_zero() { *src } else { rec.id },
                addr: Some(from),
            },
        })
        .collect()
}

pub struct NodeState {
    pub(crate) id: NodeId,
    pub(crate) session: u32,
    pub(crate) family: Family,
    /// Reachability was declared by the embedder; skip NAT detection.
    pub(crate) is_global: bool,

    pub(crate) peers: Peers,
    pub(crate) nat: Nat,
    pub(crate) dtun: Dtun,
    pub(crate) dht: Dht,
    pub(crate) advertiser: Advertiser,
    pub(crate) proxy: Proxy,
    pub(crate) dgram: DgramQueues,
    pub(crate) rdp: Rdp,
    pub(crate) lookups: Lookups,

    pub(crate) timers: Timers,
    pub(crate) outbox: Outbox,
    pub(crate) events: Vec<NodeEvent>,
    pub(crate) driver: Vec<DriverCmd>,
}

impl NodeState {
    pub fn new(family: Family) -> Self {
        let mut rng = rand::rng();
        Self {
            id: NodeId::from_bytes(rng.random()),
            session: rng.random(),
            family,
            is_global: false,
            peers: Peers::new(),
            nat: Nat::new(),
            dtun: Dtun::new(),
            dht: Dht::new(),
            advertiser: Advertiser::new(),
            proxy: Proxy::new(),
            dgram: DgramQueues::new(),
            rdp: Rdp::new(),
            lookups: Lookups::new(),
            timers: Timers::new(),
            outbox: Outbox::default(),
            events: Vec::new(),
            driver: Vec::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn session(&self) -> u32 {
        self.session
    }

    pub fn nat_state(&self) -> NatState {
        self.nat.state
    }

    /// Override the random self identifier. Input is padded or
    /// truncated to 20 bytes; call before joining, the identifier is
    /// what peers route by.
    pub fn set_id(&mut self, bytes: &[u8]) {
        self.id = NodeId::from_slice(bytes);
    }

    /// Declare this node globally reachable, skipping NAT detection.
    pub fn set_global(&mut self) {
        self.is_global = true;
    }

    /// Whether `id` currently sits in a realm's routing table.
    pub fn routing_contains(&self, realm: Realm, id: &NodeId) -> bool {
        self.realm_table(realm).has(&self.id, id)
    }

    pub(crate) fn reachable_globally(&self) -> bool {
        self.is_global || self.nat.state == NatState::Global
    }

    pub(crate) fn overlay_joined(&self) -> bool {
        (self.is_global || self.nat.state.is_terminal()) && !self.dtun.table.is_empty()
    }

    /// Arm the periodic machinery. Call once, right after construction.
    pub fn start(&mut self, now: Instant) {
        let jitter = Duration::from_secs_f64(
            SWEEP_INTERVAL.as_secs_f64() * rand::rng().random::<f64>(),
        );
        self.timers
            .schedule(now + SWEEP_INTERVAL + jitter, Timeout::PeerSweep);
        self.timers.schedule(now + TICK, Timeout::RdpTick);
        self.timers
            .schedule(now + crate::dht::REFRESH_INTERVAL, Timeout::DhtRefresh);
        self.timers
            .schedule(now + crate::advertise::REFRESH_INTERVAL, Timeout::Advertise);
        self.timers
            .schedule(now + crate::dtun::REGISTER_INTERVAL, Timeout::DtunRegister);
        self.timers
            .schedule(now + crate::proxy::REGISTER_INTERVAL, Timeout::ProxyRegister);
        if !self.is_global {
            self.timers
                .schedule(now + crate::nat::RETRY_INTERVAL, Timeout::NatRetry);
        }
    }

    // ===== driver-facing surface =====

    pub fn take_outbound(&mut self) -> Vec<(SocketAddr, Bytes)> {
        self.outbox.drain()
    }

    pub fn take_events(&mut self) -> Vec<NodeEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn take_driver_cmds(&mut self) -> Vec<DriverCmd> {
        std::mem::take(&mut self.driver)
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Fire every timer due at `now`.
    pub fn run_due(&mut self, now: Instant) {
        while let Some(timeout) = self.timers.pop_due(now) {
            self.handle_timeout(now, timeout);
        }
    }

    /// Validate and dispatch one received datagram.
    pub fn handle_datagram(&mut self, now: Instant, from: SocketAddr, datagram: &[u8]) {
        let (hdr, body) = match Header::decode(datagram) {
            Ok(decoded) => decoded,
            Err(err) => {
                log::debug!("[node] dropping malformed datagram from {}: {}", from, err);
                return;
            }
        };

        if hdr.src == self.id {
            return;
        }

        if hdr.dst != self.id && !hdr.dst.is_zero() {
            // not ours: the proxy path may still know where it goes
            let relayable = matches!(
                hdr.kind,
                MsgType::Dgram | MsgType::Rdp | MsgType::ProxyDgram | MsgType::ProxyRdp
            );
            if !(relayable && self.proxy_relay(now, &hdr.dst, datagram)) {
                log::debug!("[node] dropping datagram for {} (not us)", hdr.dst);
            }
            return;
        }

        match hdr.kind {
            MsgType::NatEcho => self.recv_nat_echo(&hdr, body, from),
            MsgType::NatEchoReply => self.recv_nat_echo_reply(now, body, from),
            MsgType::NatEchoRedirect => self.recv_nat_echo_redirect(body, from),
            MsgType::NatEchoRedirectReply => {
                // only meaningful on a probe socket; on the main socket
                // it is stray traffic
            }

            MsgType::DtunPing => self.recv_dtun_ping(now, &hdr, body, from),
            MsgType::DtunPingReply => self.recv_dtun_ping_reply(now, &hdr, body, from),
            MsgType::DtunFindNode => self.recv_dtun_find_node(now, &hdr, body, from),
            MsgType::DtunFindNodeReply => self.recv_dtun_find_node_reply(now, &hdr, body, from),
            MsgType::DtunFindValue => self.recv_dtun_find_value(now, &hdr, body, from),
            MsgType::DtunFindValueReply => self.recv_dtun_find_value_reply(now, &hdr, body, from),
            MsgType::DtunRegister => self.recv_dtun_register(now, &hdr, body, from),
            MsgType::DtunRequest => self.recv_dtun_request(now, &hdr, body, from),
            MsgType::DtunRequestBy => self.recv_dtun_request_by(body),
            MsgType::DtunRequestReply => self.recv_dtun_request_reply(now, &hdr, from),

            MsgType::DhtPing => self.recv_dht_ping(now, &hdr, body, from),
            MsgType::DhtPingReply => self.recv_dht_ping_reply(now, &hdr, body, from),
            MsgType::DhtFindNode => self.recv_dht_find_node(now, &hdr, body, from),
            MsgType::DhtFindNodeReply => self.recv_dht_find_node_reply(now, &hdr, body, from),
            MsgType::DhtFindValue => self.recv_dht_find_value(now, &hdr, body, from),
            MsgType::DhtFindValueReply => self.recv_dht_find_value_reply(now, &hdr, body, from),
            MsgType::DhtStore => self.recv_dht_store(now, &hdr, body, from),

            MsgType::Advertise => self.recv_advertise(now, &hdr, body, from),
            MsgType::AdvertiseReply => self.recv_advertise_reply(now, &hdr, body, from),

            MsgType::ProxyRegister => self.recv_proxy_register(now, &hdr, body, from),
            MsgType::ProxyStore => self.recv_proxy_store(now, &hdr, body),
            MsgType::ProxyGet => self.recv_proxy_get(now, &hdr, body),
            MsgType::ProxyGetReply => self.recv_proxy_get_reply(body),

            MsgType::Dgram | MsgType::ProxyDgram | MsgType::Rdp | MsgType::ProxyRdp => {
                self.recv_dgram(now, &hdr, body, from)
            }
        }

        self.flush_rdp(now);
    }

    fn handle_timeout(&mut self, now: Instant, timeout: Timeout) {
        match timeout {
            Timeout::PeerSweep => {
                self.peers.sweep(now);
                self.dtun.sweep(now);
                self.proxy.sweep(now);

                let jitter = Duration::from_secs_f64(
                    SWEEP_INTERVAL.as_secs_f64() * rand::rng().random::<f64>(),
                );
                self.timers
                    .schedule(now + SWEEP_INTERVAL + jitter, Timeout::PeerSweep);
            }
            Timeout::NatEcho { nonce } => self.on_echo_timeout(now, nonce),
            Timeout::NatRetry => self.on_nat_retry(now),
            Timeout::BucketPing { realm, nonce } => {
                let evicted = self.realm_table_mut(realm).on_ping_timeout(nonce);
                if let Some(id) = evicted {
                    self.peers.mark_timeout(now, id);
                }
            }
            Timeout::Query { nonce, node, .. } => self.on_query_timeout(now, nonce, node),
            Timeout::DtunRegister => self.on_dtun_register_tick(now),
            Timeout::DhtRefresh => self.on_dht_refresh(now),
            Timeout::Advertise => self.on_advertise_tick(now),
            Timeout::ProxyRegister => self.on_proxy_register_tick(now),
            Timeout::ProxyRegisterGuard { nonce } => self.on_proxy_register_guard(nonce),
            Timeout::RdpTick => {
                self.rdp.tick(now);
                self.flush_rdp(now);
                self.timers.schedule(now + TICK, Timeout::RdpTick);
            }
        }
    }

    // ===== user operations =====

    /// Bootstrap against a seed endpoint. The outcome arrives as
    /// [`NodeEvent::JoinDone`] carrying `op`.
    pub fn join(&mut self, now: Instant, seed: SocketAddr, op: u64) {
        if !self.is_global {
            self.nat.seeds.push(seed);
            self.detect_nat(now, seed);
        }

        self.start_lookup_with(
            now,
            Realm::Dtun,
            LookupKind::FindNode,
            self.id,
            LookupGoal::Join { op },
            vec![NodeAddr {
                id: NodeId::ZERO,
                addr: Some(seed),
            }],
        );
    }

    /// Store `value` under `key` with the given TTL in seconds.
    pub fn put(&mut self, now: Instant, key: Bytes, value: Bytes, ttl: u16, unique: bool) {
        if self.nat.state == NatState::SymmetricNat
            && self.put_via_proxy(key.clone(), value.clone(), ttl, unique)
        {
            return;
        }

        let origin = self.id;
        self.dht_put(now, key, value, ttl, unique, origin);
    }

    /// Fetch every value stored under `key`. The outcome arrives as
    /// [`NodeEvent::GetDone`] carrying `op`.
    pub fn get(&mut self, now: Instant, key: Bytes, op: u64) {
        if self.nat.state == NatState::SymmetricNat && self.get_via_proxy(key.clone(), op) {
            return;
        }

        self.dht_get(now, key, LookupGoal::DhtGet { op });
    }

    /// Best-effort datagram to an identifier.
    pub fn dgram(&mut self, now: Instant, data: &[u8], dst: NodeId) {
        self.send_dgram(now, data, dst);
    }

    // ===== RDP surface =====

    pub fn rdp_listen(&mut self, port: u16) -> Option<i32> {
        self.rdp.listen(port)
    }

    pub fn rdp_connect(&mut self, now: Instant, sport: u16, did: NodeId, dport: u16) -> Option<i32> {
        let desc = self.rdp.connect(sport, did, dport, now);
        self.flush_rdp(now);
        desc
    }

    pub fn rdp_send(&mut self, now: Instant, desc: i32, buf: &[u8]) -> usize {
        let sent = self.rdp.send(desc, buf, now);
        self.flush_rdp(now);
        sent
    }

    pub fn rdp_receive(&mut self, desc: i32) -> Vec<u8> {
        self.rdp.receive(desc)
    }

    pub fn rdp_close(&mut self, now: Instant, desc: i32) {
        self.rdp.close(desc, now);
        self.flush_rdp(now);
    }

    pub fn rdp_state(&self, desc: i32) -> RdpState {
        self.rdp.state_of(desc)
    }

    /// Feed a received RDP segment into the engine.
    pub(crate) fn rdp_input(&mut self, now: Instant, src: NodeId, payload: &[u8]) {
        self.rdp.input(src, payload, now);
    }

    /// Ship queued segments and surface connection events. Loops
    /// because shipping to our own identifier loops straight back into
    /// the engine.
    pub(crate) fn flush_rdp(&mut self, now: Instant) {
        loop {
            let out = self.rdp.take_output();
            let events = self.rdp.take_events();
            if out.is_empty() && events.is_empty() {
                break;
            }

            for (did, segment) in out {
                self.send_payload_to(now, did, MsgType::Rdp, segment);
            }
            for (desc, addr, event) in events {
                self.events.push(NodeEvent::Rdp { desc, addr, event });
            }
        }
    }

    // ===== shared helpers =====

    pub(crate) fn realm_table(&self, realm: Realm) -> &RoutingTable {
        match realm {
            Realm::Dtun => &self.dtun.table,
            Realm::Dht => &self.dht.table,
        }
    }

    pub(crate) fn realm_table_mut(&mut self, realm: Realm) -> &mut RoutingTable {
        match realm {
            Realm::Dtun => &mut self.dtun.table,
            Realm::Dht => &mut self.dht.table,
        }
    }

    /// Offer a live peer to a realm's routing table, pinging the bucket
    /// incumbent when the bucket is full.
    pub(crate) fn offer_to_table(&mut self, now: Instant, realm: Realm, id: NodeId, addr: SocketAddr) {
        let self_id = self.id;
        let node = NodeAddr {
            id,
            addr: Some(addr),
        };

        let table = match realm {
            Realm::Dtun => &mut self.dtun.table,
            Realm::Dht => &mut self.dht.table,
        };
        let Some(ping) = table.add(&self_id, node, now, &mut self.timers) else {
            return;
        };

        let kind = match realm {
            Realm::Dtun => MsgType::DtunPing,
            Realm::Dht => MsgType::DhtPing,
        };
        let Some(incumbent_addr) = ping.incumbent.addr else {
            return;
        };

        let mut buf = BytesMut::new();
        PlainNonce { nonce: ping.nonce }.encode(kind, &self_id, &ping.incumbent.id, &mut buf);
        self.outbox.push(incumbent_addr, buf.freeze());
    }

    /// A peer came back with a different session nonce: every piece of
    /// state tied to its old incarnation goes.
    pub(crate) fn forget_restarted_peer(&mut self, id: &NodeId) {
        let self_id = self.id;
        self.dtun.table.remove(&self_id, id);
        self.dht.table.remove(&self_id, id);
    }

    /// Encode a node list, turning the loopback self entry into the
    /// sender sentinel.
    pub(crate) fn nodes_to_records(&self, nodes: &[NodeAddr]) -> Vec<NodeRecord> {
        nodes
            .iter()
            .map(|n| NodeRecord {
                id: n.id,
                addr: n.addr,
            })
            .collect()
    }

    /// NAT echo-redirect: answer on the requested port instead.
    pub(crate) fn recv_nat_echo_redirect(&mut self, body: &[u8], from: SocketAddr) {
        let Ok(msg) = codec::messages::EchoRedirect::decode(body) else {
            return;
        };

        let mut reply_to = from;
        reply_to.set_port(msg.port);

        let mut buf = BytesMut::new();
        codec::messages::EchoReply {
            nonce: msg.nonce,
            observed: from,
        }
        .encode(
            MsgType::NatEchoRedirectReply,
            &self.id,
            &NodeId::ZERO,
            &mut buf,
        );
        self.outbox.push(reply_to, buf.freeze());
    }

    /// Every lookup ends here; the goal says what happens next.
    pub(crate) fn lookup_finished(&mut self, now: Instant, query: Query, result: LookupResult) {
        match query.goal {
            LookupGoal::Join { op } => {
                let ok = match &result {
                    LookupResult::Nodes(nodes) => !nodes.is_empty(),
                    _ => false,
                };
                self.events.push(NodeEvent::JoinDone { op, ok });

                if ok {
                    if let LookupResult::Nodes(nodes) = result {
                        // seed the storage realm through the same nodes
                        // and announce ourselves to the rendezvous realm
                        self.start_lookup_with(
                            now,
                            Realm::Dht,
                            LookupKind::FindNode,
                            self.id,
                            LookupGoal::Refresh,
                            nodes,
                        );
                        self.dtun_register(now);
                    }
                }
            }
            LookupGoal::Refresh => {}
            LookupGoal::DtunRegister => {
                if let LookupResult::Nodes(nodes) = result {
                    self.dtun_register_finished(&nodes);
                }
            }
            LookupGoal::DhtStore {
                key,
                value,
                ttl,
                unique,
                origin,
            } => {
                if let LookupResult::Nodes(nodes) = result {
                    self.dht_store_finished(
                        now,
                        query.target,
                        key,
                        value,
                        ttl,
                        unique,
                        origin,
                        &nodes,
                    );
                }
            }
            LookupGoal::DhtGet { op } => {
                let values = match result {
                    LookupResult::Values(values) => Some(values),
                    _ => None,
                };
                self.events.push(NodeEvent::GetDone { op, values });
            }
            LookupGoal::ProxiedGet { nonce, requester } => {
                let values = match result {
                    LookupResult::Values(values) => Some(values),
                    _ => None,
                };
                self.proxied_get_finished(now, nonce, requester, values);
            }
            LookupGoal::Resolve { target } => match result {
                LookupResult::Endpoint {
                    endpoint,
                    registrar,
                } => {
                    if let Some(addr) = registrar.addr {
                        self.send_dtun_request(addr, &registrar.id, target);
                    }
                    self.resolve_finished(now, target, Some(endpoint));
                }
                LookupResult::Nodes(nodes) => {
                    let found = nodes.iter().find(|n| n.id == target).copied();
                    self.resolve_finished(now, target, found);
                }
                LookupResult::Values(_) => {
                    self.resolve_finished(now, target, None);
                }
            },
            LookupGoal::ProxyRegister => {
                if let LookupResult::Nodes(nodes) = result {
                    self.proxy_register_finished(&nodes);
                }
            }
        }
    }

    /// After NAT classification lands, pull the overlay in: seed the
    /// storage realm and announce ourselves.
    pub(crate) fn join_overlay(&mut self, now: Instant) {
        self.start_lookup(
            now,
            Realm::Dht,
            LookupKind::FindNode,
            self.id,
            LookupGoal::Refresh,
        );
        self.dtun_register(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sock(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn malformed_datagrams_are_dropped_silently() {
        let mut node = NodeState::new(Family::Inet);
        let now = Instant::now();

        node.handle_datagram(now, sock(1000), &[]);
        node.handle_datagram(now, sock(1000), &[0xba]);
        node.handle_datagram(now, sock(1000), &[0u8; 64]);

        // one byte short of a full header, with plausible leading fields
        let mut truncated = vec![0u8; codec::HEADER_LEN - 1];
        truncated[0] = 0xba;
        truncated[1] = 0xbe;
        node.handle_datagram(now, sock(1000), &truncated);

        let mut bad_magic = vec![0u8; codec::HEADER_LEN];
        bad_magic[0] = 0xde;
        bad_magic[1] = 0xad;
        node.handle_datagram(now, sock(1000), &bad_magic);

        assert!(node.take_outbound().is_empty());
        assert!(node.take_events().is_empty());
    }

    #[test]
    fn mismatched_destination_is_dropped_without_registration() {
        let mut node = NodeState::new(Family::Inet);
        let now = Instant::now();

        let mut buf = BytesMut::new();
        codec::messages::encode_payload(
            MsgType::Dgram,
            &NodeId::from_bit(1),
            &NodeId::from_bit(2), // not us
            b"hello",
            &mut buf,
        );
        node.handle_datagram(now, sock(1000), &buf);

        assert!(node.take_outbound().is_empty());
        assert!(node.take_events().is_empty());
    }

    #[test]
    fn dgram_for_us_is_delivered() {
        let mut node = NodeState::new(Family::Inet);
        let now = Instant::now();
        let self_id = node.id();

        let mut buf = BytesMut::new();
        codec::messages::encode_payload(
            MsgType::Dgram,
            &NodeId::from_bit(1),
            &self_id,
            b"hello",
            &mut buf,
        );
        node.handle_datagram(now, sock(1000), &buf);

        let events = node.take_events();
        assert!(matches!(
            &events[..],
            [NodeEvent::Dgram { from, data }]
                if *from == NodeId::from_bit(1) && &data[..] == b"hello"
        ));
    }

    #[test]
    fn unresolvable_dgram_is_dropped() {
        let mut node = NodeState::new(Family::Inet);
        let now = Instant::now();
        let dst = NodeId::from_bit(9);

        // the routing table is empty, so the resolution lookup has no
        // candidates and fails on the spot: queue gone, nothing sent
        node.dgram(now, b"queued", dst);
        assert_eq!(node.dgram.pending(&dst), 0);
        assert!(node.take_outbound().is_empty());
    }

    #[test]
    fn echo_is_answered_with_observed_endpoint() {
        let mut node = NodeState::new(Family::Inet);
        let now = Instant::now();
        let self_id = node.id();

        let mut buf = BytesMut::new();
        codec::messages::Echo { nonce: 77 }.encode(
            MsgType::NatEcho,
            &NodeId::from_bit(1),
            &self_id,
            &mut buf,
        );
        node.handle_datagram(now, sock(4567), &buf);

        let out = node.take_outbound();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, sock(4567));

        let (hdr, body) = Header::decode(&out[0].1).unwrap();
        assert_eq!(hdr.kind, MsgType::NatEchoReply);
        let reply = codec::messages::EchoReply::decode(body).unwrap();
        assert_eq!(reply.nonce, 77);
        assert_eq!(reply.observed, sock(4567));
    }

    #[test]
    fn join_kicks_off_detection_and_lookup() {
        let mut node = NodeState::new(Family::Inet);
        let now = Instant::now();

        node.join(now, sock(9000), 1);

        let out = node.take_outbound();
        // one NAT echo plus one bootstrap find-node, both to the seed
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|(to, _)| *to == sock(9000)));

        let kinds: Vec<MsgType> = out
            .iter()
            .map(|(_, d)| Header::decode(d).unwrap().0.kind)
            .collect();
        assert!(kinds.contains(&MsgType::NatEcho));
        assert!(kinds.contains(&MsgType::DtunFindNode));
        assert_eq!(node.nat_state(), NatState::EchoWait1);
    }

    #[test]
    fn failed_join_reports_not_ok() {
        let mut node = NodeState::new(Family::Inet);
        let now = Instant::now();

        node.join(now, sock(9000), 42);
        node.take_outbound();

        // nobody answers: the query timer fires, the lookup dies
        node.run_due(now + Duration::from_secs(30));

        let events = node.take_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, NodeEvent::JoinDone { op: 42, ok: false })));
    }
}
