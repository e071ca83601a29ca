//! Best-effort datagrams with resolve-then-transmit queues.
//!
//! `send(buf, id)` either ships immediately (the destination's endpoint
//! is in the directory) or queues the chunks and kicks off exactly one
//! resolution per destination — a DTUN rendezvous when the overlay is
//! joined, a plain DHT find-node otherwise. The queue drains when the
//! resolution lands and is dropped when it fails; best effort means no
//! second try.

use std::collections::VecDeque;
use std::time::Instant;

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use bytes::{Bytes, BytesMut};

use codec::id::NodeId;
use codec::messages::encode_payload;
use codec::{Header, MsgType};

use crate::lookup::{LookupGoal, LookupKind};
use crate::node::NodeState;
use crate::{NodeAddr, NodeEvent, Realm};

/// Datagrams larger than this are split.
pub const MAX_DATA: usize = 1024;

#[derive(Debug, Default)]
pub struct DgramQueues {
    queues: HashMap<NodeId, VecDeque<(MsgType, Bytes)>>,
    requesting: HashSet<NodeId>,
}

impl DgramQueues {
    pub fn new() -> Self {
        Self {
            queues: HashMap::new(),
            requesting: HashSet::new(),
        }
    }

    pub fn pending(&self, id: &NodeId) -> usize {
        self.queues.get(id).map(|q| q.len()).unwrap_or(0)
    }
}

impl NodeState {
    /// Send an application datagram, splitting into chunks of at most
    /// [`MAX_DATA`] bytes.
    pub(crate) fn send_dgram(&mut self, now: Instant, data: &[u8], dst: NodeId) {
        if data.is_empty() {
            return;
        }

        for chunk in data.chunks(MAX_DATA) {
            self.send_payload_to(now, dst, MsgType::Dgram, Bytes::copy_from_slice(chunk));
        }
    }

    /// Ship one framed payload toward `dst`, resolving its endpoint
    /// first when necessary.
    pub(crate) fn send_payload_to(&mut self, now: Instant, dst: NodeId, kind: MsgType, payload: Bytes) {
        if dst == self.id {
            // local delivery, same path a received frame takes
            let src = self.id;
            self.deliver_payload(now, kind, &src, payload);
            return;
        }

        if let Some(addr) = self.peers.get_by_id(&dst) {
            let mut buf = BytesMut::new();
            encode_payload(kind, &self.id, &dst, &payload, &mut buf);
            self.outbox.push(addr, buf.freeze());
            return;
        }

        self.dgram
            .queues
            .entry(dst)
            .or_default()
            .push_back((kind, payload));

        if self.dgram.requesting.insert(dst) {
            if self.overlay_joined() {
                self.dtun_request(now, dst);
            } else {
                self.start_lookup(
                    now,
                    Realm::Dht,
                    LookupKind::FindNode,
                    dst,
                    LookupGoal::Resolve { target: dst },
                );
            }
        }
    }

    /// A resolution finished. Drain the queue on success, drop it on
    /// failure.
    pub(crate) fn resolve_finished(&mut self, now: Instant, target: NodeId, found: Option<NodeAddr>) {
        self.dgram.requesting.remove(&target);

        match found.and_then(|n| n.addr) {
            Some(addr) => {
                self.peers.add(now, target, addr);

                let Some(queue) = self.dgram.queues.remove(&target) else {
                    return;
                };
                for (kind, payload) in queue {
                    let mut buf = BytesMut::new();
                    encode_payload(kind, &self.id, &target, &payload, &mut buf);
                    self.outbox.push(addr, buf.freeze());
                }
            }
            None => {
                let dropped = self.dgram.queues.remove(&target).map(|q| q.len()).unwrap_or(0);
                if dropped > 0 {
                    log::debug!(
                        "[dgram] dropping {} queued datagrams for unresolvable {}",
                        dropped,
                        target
                    );
                }
            }
        }
    }

    /// Deliver the payload of a received dgram-family frame.
    pub(crate) fn deliver_payload(&mut self, now: Instant, kind: MsgType, src: &NodeId, payload: Bytes) {
        match kind {
            MsgType::Rdp | MsgType::ProxyRdp => {
                self.rdp_input(now, *src, &payload);
            }
            _ => {
                self.events.push(NodeEvent::Dgram {
                    from: *src,
                    data: payload,
                });
            }
        }
    }

    pub(crate) fn recv_dgram(&mut self, now: Instant, hdr: &Header, body: &[u8], from: std::net::SocketAddr) {
        self.peers.refresh(now, &hdr.src);
        let _ = from;
        self.deliver_payload(now, hdr.kind, &hdr.src, Bytes::copy_from_slice(body));
    }
}
