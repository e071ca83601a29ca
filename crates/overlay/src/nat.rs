//! NAT classification.
//!
//! A node starts `undefined` and probes its way to one of three terminal
//! states by bouncing echoes off peers that are already reachable:
//!
//! - an `echo` answered through a *different* local socket
//!   (`echo-redirect`) proves unfiltered inbound reach: `global`;
//! - an unanswered echo means some NAT is in the way: `nat`, refined by
//!   echoing off two distinct peers — the same observed port from both is
//!   a `cone` NAT, different ports a `symmetric` one.
//!
//! Reaching a terminal state unlocks overlay participation: the node
//! joins the DHT, and a symmetric node additionally registers with a
//! proxy, since nothing can reach it directly.
//!
//! The redirect probe needs a second, short-lived UDP socket; the engine
//! asks the driver to bind one ([`DriverCmd::OpenProbe`]) and hears back
//! through [`NodeState::probe_opened`] / [`NodeState::probe_outcome`].

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ahash::{HashMap, HashMapExt};
use bytes::BytesMut;
use rand::Rng;

use codec::messages::{Echo, EchoRedirect, EchoReply};
use codec::{Header, MsgType};

use crate::node::{DriverCmd, NodeState};
use crate::timer::Timeout;
use crate::NodeEvent;

/// How long an echo may go unanswered.
pub const ECHO_TIMEOUT: Duration = Duration::from_secs(3);

/// Detection retry cadence until a terminal state is reached.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatState {
    Undefined,
    EchoWait1,
    EchoRedirectWait,
    Global,
    Nat,
    EchoWait2,
    ConeNat,
    SymmetricNat,
}

impl NatState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NatState::Global | NatState::ConeNat | NatState::SymmetricNat
        )
    }
}

#[derive(Debug)]
struct Probe {
    peer: SocketAddr,
}

#[derive(Debug)]
pub struct Nat {
    pub state: NatState,
    /// Echo nonces in flight, each with its timer token.
    echo_wait: HashMap<u32, u64>,
    /// First observed port per type-detection nonce.
    first_port: HashMap<u32, u16>,
    /// Redirect probe in flight, keyed by nonce.
    probes: HashMap<u32, Probe>,
    /// The externally observed endpoint, known once global.
    pub observed: Option<SocketAddr>,
    /// Peers to probe against; the bootstrap seed plus whatever the
    /// directory has learned since.
    pub seeds: Vec<SocketAddr>,
}

impl Nat {
    pub fn new() -> Self {
        Self {
            state: NatState::Undefined,
            echo_wait: HashMap::new(),
            first_port: HashMap::new(),
            probes: HashMap::new(),
            observed: None,
            seeds: Vec::new(),
        }
    }

    fn unique_nonce(&self) -> u32 {
        let mut rng = rand::rng();
        loop {
            let nonce: u32 = rng.random();
            if !self.echo_wait.contains_key(&nonce) && !self.probes.contains_key(&nonce) {
                return nonce;
            }
        }
    }
}

impl Default for Nat {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeState {
    /// Probe reachability against `peer`. No-op outside `undefined`.
    pub(crate) fn detect_nat(&mut self, now: Instant, peer: SocketAddr) {
        if self.nat.state != NatState::Undefined || self.is_global {
            return;
        }

        let nonce = self.nat.unique_nonce();
        let timer = self
            .timers
            .schedule(now + ECHO_TIMEOUT, Timeout::NatEcho { nonce });
        self.nat.echo_wait.insert(nonce, timer);
        self.nat.state = NatState::EchoWait1;

        self.send_echo(nonce, peer);
        log::debug!("[nat] echo probe to {} nonce {:08x}", peer, nonce);
    }

    /// Refine `nat` into cone or symmetric by echoing off two peers.
    pub(crate) fn detect_nat_type(&mut self, now: Instant, p1: SocketAddr, p2: SocketAddr) {
        if self.nat.state != NatState::Nat {
            return;
        }

        let nonce = self.nat.unique_nonce();
        let timer = self
            .timers
            .schedule(now + ECHO_TIMEOUT, Timeout::NatEcho { nonce });
        self.nat.echo_wait.insert(nonce, timer);
        self.nat.first_port.remove(&nonce);
        self.nat.state = NatState::EchoWait2;

        self.send_echo(nonce, p1);
        self.send_echo(nonce, p2);
        log::debug!("[nat] type probe to {} and {}", p1, p2);
    }

    fn send_echo(&mut self, nonce: u32, peer: SocketAddr) {
        let mut buf = BytesMut::new();
        let dst = self.peers.get_by_addr(&peer).unwrap_or_default();
        Echo { nonce }.encode(MsgType::NatEcho, &self.id, &dst, &mut buf);
        self.outbox.push(peer, buf.freeze());
    }

    /// Answer an echo with the endpoint the probe was observed from.
    pub(crate) fn recv_nat_echo(&mut self, hdr: &Header, body: &[u8], from: SocketAddr) {
        let Ok(echo) = Echo::decode(body) else {
            return;
        };

        let mut buf = BytesMut::new();
        EchoReply {
            nonce: echo.nonce,
            observed: from,
        }
        .encode(MsgType::NatEchoReply, &self.id, &hdr.src, &mut buf);
        self.outbox.push(from, buf.freeze());
    }

    pub(crate) fn recv_nat_echo_reply(&mut self, now: Instant, body: &[u8], from: SocketAddr) {
        let Ok(reply) = EchoReply::decode(body) else {
            return;
        };

        match self.nat.state {
            NatState::EchoWait1 => self.echo_reply_wait1(reply, from),
            NatState::EchoWait2 => self.echo_reply_wait2(now, reply),
            _ => {}
        }
    }

    /// First echo answered: reachability unknown yet — ask the peer to
    /// answer again on a fresh socket.
    fn echo_reply_wait1(&mut self, reply: EchoReply, from: SocketAddr) {
        let Some(timer) = self.nat.echo_wait.remove(&reply.nonce) else {
            return;
        };
        self.timers.cancel(timer);

        let nonce = self.nat.unique_nonce();
        self.nat.probes.insert(nonce, Probe { peer: from });
        self.nat.state = NatState::EchoRedirectWait;
        self.driver.push(DriverCmd::OpenProbe { nonce });
    }

    /// The driver bound the probe socket: tell the peer where to answer.
    pub fn probe_opened(&mut self, nonce: u32, local_port: u16) {
        let Some(probe) = self.nat.probes.get(&nonce) else {
            return;
        };
        let peer = probe.peer;

        let mut buf = BytesMut::new();
        let dst = self.peers.get_by_addr(&peer).unwrap_or_default();
        EchoRedirect {
            nonce,
            port: local_port,
        }
        .encode(&self.id, &dst, &mut buf);
        self.outbox.push(peer, buf.freeze());
    }

    /// Whatever the probe socket saw before its deadline (or `None`).
    pub fn probe_outcome(&mut self, now: Instant, nonce: u32, datagram: Option<&[u8]>) {
        if self.nat.probes.remove(&nonce).is_none() {
            return;
        }
        if self.nat.state != NatState::EchoRedirectWait {
            return;
        }

        let reply = datagram
            .and_then(|bytes| Header::decode(bytes).ok())
            .filter(|(hdr, _)| hdr.kind == MsgType::NatEchoRedirectReply)
            .and_then(|(_, body)| EchoReply::decode(body).ok())
            .filter(|reply| reply.nonce == nonce);

        match reply {
            Some(reply) => {
                self.nat.state = NatState::Global;
                self.nat.observed = Some(reply.observed);
                self.events.push(NodeEvent::NatState {
                    state: NatState::Global,
                });
                log::info!("[nat] globally reachable at {}", reply.observed);
                self.join_overlay(now);
            }
            None => {
                // inconclusive; the retry timer will start over
                self.nat.state = NatState::Undefined;
            }
        }
    }

    /// Second-stage replies: compare the ports two peers observed.
    fn echo_reply_wait2(&mut self, now: Instant, reply: EchoReply) {
        if !self.nat.echo_wait.contains_key(&reply.nonce) {
            return;
        }

        let port = reply.observed.port();
        match self.nat.first_port.get(&reply.nonce) {
            None => {
                self.nat.first_port.insert(reply.nonce, port);
            }
            Some(first) => {
                let state = if *first == port {
                    NatState::ConeNat
                } else {
                    NatState::SymmetricNat
                };

                let timer = self
                    .nat
                    .echo_wait
                    .remove(&reply.nonce)
                    .expect("checked above");
                self.timers.cancel(timer);
                self.nat.first_port.remove(&reply.nonce);
                self.nat.state = state;
                self.events.push(NodeEvent::NatState { state });
                log::info!("[nat] behind a {:?}", state);

                self.join_overlay(now);
                if state == NatState::SymmetricNat {
                    self.proxy_register(now);
                }
            }
        }
    }

    /// An echo (either stage) went unanswered.
    pub(crate) fn on_echo_timeout(&mut self, now: Instant, nonce: u32) {
        if self.nat.echo_wait.remove(&nonce).is_none() {
            return;
        }
        self.nat.first_port.remove(&nonce);

        match self.nat.state {
            NatState::EchoWait1 => {
                self.nat.state = NatState::Nat;
                self.events.push(NodeEvent::NatState {
                    state: NatState::Nat,
                });
                log::debug!("[nat] echo unanswered, assuming NAT");
                self.try_detect_nat_type(now);
            }
            NatState::EchoWait2 => {
                self.nat.state = NatState::Nat;
            }
            _ => {}
        }
    }

    /// Kick type detection when two distinct probe peers are known.
    pub(crate) fn try_detect_nat_type(&mut self, now: Instant) {
        let mut peers = self.nat.seeds.clone();
        peers.dedup();
        if peers.len() >= 2 {
            self.detect_nat_type(now, peers[0], peers[1]);
        }
    }

    /// Periodic retry until a terminal state is reached.
    pub(crate) fn on_nat_retry(&mut self, now: Instant) {
        if self.is_global || self.nat.state.is_terminal() {
            return;
        }

        match self.nat.state {
            NatState::Undefined => {
                if let Some(peer) = self.nat.seeds.first().copied() {
                    self.detect_nat(now, peer);
                }
            }
            NatState::Nat => self.try_detect_nat_type(now),
            _ => {}
        }

        self.timers
            .schedule(now + RETRY_INTERVAL, Timeout::NatRetry);
    }
}
