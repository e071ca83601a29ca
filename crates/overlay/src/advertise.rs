//! Opportunistic reverse routing hints.
//!
//! Lookups only teach *us* about other nodes; an advertise tells a node
//! we already know about *us*, so its rendezvous table fills in the
//! reverse direction without waiting for traffic. A jittered periodic
//! refresh walks the nodes closest to our identifier.

use std::time::{Duration, Instant};

use ahash::{HashMap, HashMapExt};
use bytes::BytesMut;
use rand::Rng;

use codec::messages::{Advertise as AdvertiseMsg, PlainNonce};
use codec::{Header, MsgType};

use crate::node::NodeState;
use crate::routing::K;
use crate::timer::Timeout;
use crate::{NodeAddr, Realm};

/// Base refresh cadence; jittered up to twice this.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(100);

/// Replies arriving later than this are ignored.
pub const ADVERTISE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
pub struct Advertiser {
    pending: HashMap<u32, Instant>,
}

impl Advertiser {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    fn unique_nonce(&self) -> u32 {
        let mut rng = rand::rng();
        loop {
            let nonce: u32 = rng.random();
            if !self.pending.contains_key(&nonce) {
                return nonce;
            }
        }
    }
}

impl NodeState {
    /// Advertise ourselves to the nodes nearest our identifier.
    pub(crate) fn advertise_refresh(&mut self, now: Instant) {
        self.advertiser
            .pending
            .retain(|_, at| now.duration_since(*at) <= ADVERTISE_TIMEOUT);

        let nodes: Vec<NodeAddr> = self.dtun.table.lookup(&self.id, &self.id, K);
        for node in nodes {
            let Some(addr) = node.addr else {
                continue;
            };

            let nonce = self.advertiser.unique_nonce();
            self.advertiser.pending.insert(nonce, now);

            let mut buf = BytesMut::new();
            AdvertiseMsg {
                nonce,
                session: self.session,
            }
            .encode(&self.id, &node.id, &mut buf);
            self.outbox.push(addr, buf.freeze());
        }
    }

    pub(crate) fn recv_advertise(
        &mut self,
        now: Instant,
        hdr: &Header,
        body: &[u8],
        from: std::net::SocketAddr,
    ) {
        let Ok(msg) = AdvertiseMsg::decode(body) else {
            return;
        };

        let restarted = self.peers.add_with_session(now, hdr.src, from, msg.session);
        if restarted {
            self.forget_restarted_peer(&hdr.src);
        }
        self.offer_to_table(now, Realm::Dtun, hdr.src, from);

        let mut buf = BytesMut::new();
        PlainNonce { nonce: msg.nonce }.encode(
            MsgType::AdvertiseReply,
            &self.id,
            &hdr.src,
            &mut buf,
        );
        self.outbox.push(from, buf.freeze());
    }

    pub(crate) fn recv_advertise_reply(
        &mut self,
        now: Instant,
        hdr: &Header,
        body: &[u8],
        from: std::net::SocketAddr,
    ) {
        let Ok(msg) = PlainNonce::decode(body) else {
            return;
        };

        if self.advertiser.pending.remove(&msg.nonce).is_none() {
            return;
        }

        self.peers.add(now, hdr.src, from);
        self.offer_to_table(now, Realm::Dtun, hdr.src, from);
    }

    pub(crate) fn on_advertise_tick(&mut self, now: Instant) {
        self.advertise_refresh(now);

        let jitter = Duration::from_secs_f64(
            REFRESH_INTERVAL.as_secs_f64() * rand::rng().random::<f64>(),
        );
        self.timers
            .schedule(now + REFRESH_INTERVAL + jitter, Timeout::Advertise);
    }
}
