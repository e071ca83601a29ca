//! DHT: the storage realm.
//!
//! Key/value records live on the K nodes whose identifiers are closest to
//! the SHA-1 of the key. A key can hold several values at once — one per
//! originator, or more when the originator appends — and every record
//! carries a TTL after which holders drop it. Originators re-announce
//! their records at half the TTL so a value outlives churn as long as its
//! owner does.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use bytes::{Bytes, BytesMut};

use codec::id::NodeId;
use codec::messages::{
    DhtFindValue, DhtFindValueReply, FindNode, FindNodeReply, FindValuePayload, PlainNonce, Store,
};
use codec::{Header, MsgType};

use crate::lookup::{LookupGoal, LookupKind};
use crate::node::{records_to_nodes, NodeState};
use crate::routing::{RoutingTable, K};
use crate::timer::Timeout;
use crate::Realm;

/// Cadence of the storage sweep and owner re-announce.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct IdKey {
    id: NodeId,
    key: Bytes,
}

#[derive(Debug)]
struct StoredEntry {
    origin: NodeId,
    value: Bytes,
    ttl: u16,
    stored_at: Instant,
    /// Replica holders this record is known to sit on.
    recvd: HashSet<NodeId>,
}

impl StoredEntry {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.stored_at) > Duration::from_secs(self.ttl as u64)
    }
}

#[derive(Debug)]
pub struct Dht {
    pub table: RoutingTable,
    store: HashMap<IdKey, Vec<StoredEntry>>,
}

impl Dht {
    pub fn new() -> Self {
        Self {
            table: RoutingTable::new(Realm::Dht),
            store: HashMap::new(),
        }
    }

    fn values_for(&self, now: Instant, id: &NodeId, key: &Bytes) -> Vec<Bytes> {
        self.store
            .get(&IdKey { id: *id, key: key.clone() })
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| !e.expired(now))
                    .map(|e| e.value.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn insert(
        &mut self,
        now: Instant,
        id: NodeId,
        key: Bytes,
        value: Bytes,
        ttl: u16,
        unique: bool,
        origin: NodeId,
        replica: Option<NodeId>,
    ) {
        let entries = self.store.entry(IdKey { id, key }).or_default();

        if unique {
            entries.retain(|e| e.origin != origin);
        }

        if let Some(existing) = entries
            .iter_mut()
            .find(|e| e.origin == origin && e.value == value)
        {
            existing.ttl = ttl;
            existing.stored_at = now;
            if let Some(replica) = replica {
                existing.recvd.insert(replica);
            }
            return;
        }

        let mut recvd = HashSet::new();
        if let Some(replica) = replica {
            recvd.insert(replica);
        }

        entries.push(StoredEntry {
            origin,
            value,
            ttl,
            stored_at: now,
            recvd,
        });
    }

    pub fn sweep(&mut self, now: Instant) {
        self.store.retain(|_, entries| {
            entries.retain(|e| !e.expired(now));
            !entries.is_empty()
        });
    }

    pub fn stored_keys(&self) -> usize {
        self.store.len()
    }
}

impl Default for Dht {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeState {
    pub(crate) fn recv_dht_ping(&mut self, now: Instant, hdr: &Header, body: &[u8], from: SocketAddr) {
        let Ok(ping) = PlainNonce::decode(body) else {
            return;
        };

        self.peers.add(now, hdr.src, from);

        let mut buf = BytesMut::new();
        PlainNonce { nonce: ping.nonce }.encode(
            MsgType::DhtPingReply,
            &self.id,
            &hdr.src,
            &mut buf,
        );
        self.outbox.push(from, buf.freeze());
    }

    pub(crate) fn recv_dht_ping_reply(
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
        self.dht
            .table
            .on_ping_reply(reply.nonce, &hdr.src, from, &mut self.timers);
    }

    pub(crate) fn recv_dht_find_node(
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
        self.offer_to_table(now, Realm::Dht, hdr.src, from);

        let nodes = self.dht.table.lookup(&self.id, &msg.target, K);
        let mut buf = BytesMut::new();
        FindNodeReply {
            nonce: msg.nonce,
            target: msg.target,
            family: self.family,
            nodes: self.nodes_to_records(&nodes),
        }
        .encode(MsgType::DhtFindNodeReply, &self.id, &hdr.src, &mut buf);
        self.outbox.push(from, buf.freeze());
    }

    pub(crate) fn recv_dht_find_node_reply(
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
        self.offer_to_table(now, Realm::Dht, hdr.src, from);

        let nodes = records_to_nodes(&msg.nodes, from, &hdr.src);
        self.lookup_nodes_received(now, msg.nonce, &hdr.src, nodes);
    }

    pub(crate) fn recv_dht_find_value(
        &mut self,
        now: Instant,
        hdr: &Header,
        body: &[u8],
        from: SocketAddr,
    ) {
        let Ok(msg) = DhtFindValue::decode(body) else {
            return;
        };

        self.peers.add(now, hdr.src, from);
        self.offer_to_table(now, Realm::Dht, hdr.src, from);

        let values = self.dht.values_for(now, &msg.target, &msg.key);
        let payload = if values.is_empty() {
            let nodes = self.dht.table.lookup(&self.id, &msg.target, K);
            FindValuePayload::Nodes(self.nodes_to_records(&nodes))
        } else {
            FindValuePayload::Values(values)
        };

        let mut buf = BytesMut::new();
        DhtFindValueReply {
            nonce: msg.nonce,
            target: msg.target,
            family: self.family,
            payload,
        }
        .encode(&self.id, &hdr.src, &mut buf);
        self.outbox.push(from, buf.freeze());
    }

    pub(crate) fn recv_dht_find_value_reply(
        &mut self,
        now: Instant,
        hdr: &Header,
        body: &[u8],
        from: SocketAddr,
    ) {
        let Ok(msg) = DhtFindValueReply::decode(body) else {
            return;
        };

        self.peers.add(now, hdr.src, from);
        self.offer_to_table(now, Realm::Dht, hdr.src, from);

        match msg.payload {
            FindValuePayload::Values(values) => {
                self.lookup_values_received(now, msg.nonce, &hdr.src, values);
            }
            FindValuePayload::Nodes(records) => {
                let nodes = records_to_nodes(&records, from, &hdr.src);
                self.lookup_nodes_received(now, msg.nonce, &hdr.src, nodes);
            }
        }
    }

    pub(crate) fn recv_dht_store(&mut self, now: Instant, hdr: &Header, body: &[u8], from: SocketAddr) {
        let Ok(msg) = Store::decode(body) else {
            return;
        };

        self.peers.add(now, hdr.src, from);
        self.dht.insert(
            now,
            msg.target,
            msg.key,
            msg.value,
            msg.ttl,
            msg.unique,
            hdr.src,
            Some(hdr.src),
        );
        log::debug!("[dht] stored record for {} from {}", msg.target, hdr.src);
    }

    /// Place `value` under `key` on the closest replica set.
    pub(crate) fn dht_put(
        &mut self,
        now: Instant,
        key: Bytes,
        value: Bytes,
        ttl: u16,
        unique: bool,
        origin: NodeId,
    ) {
        let target = NodeId::sha1(&key);
        self.start_lookup(
            now,
            Realm::Dht,
            LookupKind::FindNode,
            target,
            LookupGoal::DhtStore {
                key,
                value,
                ttl,
                unique,
                origin,
            },
        );
    }

    /// Continuation of [`dht_put`]: ship the store messages.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn dht_store_finished(
        &mut self,
        now: Instant,
        target: NodeId,
        key: Bytes,
        value: Bytes,
        ttl: u16,
        unique: bool,
        origin: NodeId,
        nodes: &[crate::NodeAddr],
    ) {
        // if our own identifier belongs in the replica set, keep a copy
        let self_distance = self.id.distance(&target);
        let in_replica_set = nodes.len() < K
            || nodes
                .iter()
                .take(K)
                .any(|n| self_distance < n.id.distance(&target));
        if in_replica_set {
            self.dht.insert(
                now,
                target,
                key.clone(),
                value.clone(),
                ttl,
                unique,
                origin,
                None,
            );
        }

        let msg = Store {
            target,
            ttl,
            unique,
            key,
            value,
        };

        for node in nodes.iter().take(K) {
            let Some(addr) = node.addr else {
                continue;
            };

            let mut buf = BytesMut::new();
            msg.encode(MsgType::DhtStore, &self.id, &node.id, &mut buf);
            self.outbox.push(addr, buf.freeze());
        }
    }

    /// Fetch every value stored under `key`.
    pub(crate) fn dht_get(&mut self, now: Instant, key: Bytes, goal: LookupGoal) {
        let target = NodeId::sha1(&key);
        self.start_lookup(
            now,
            Realm::Dht,
            LookupKind::FindValue { key: Some(key) },
            target,
            goal,
        );
    }

    /// Periodic storage sweep plus owner re-announce.
    pub(crate) fn on_dht_refresh(&mut self, now: Instant) {
        self.dht.sweep(now);

        // re-announce records we originated once half their TTL is gone
        let mut reannounce = Vec::new();
        for (id_key, entries) in self.dht.store.iter() {
            for entry in entries {
                if entry.origin != self.id {
                    continue;
                }
                let half = Duration::from_secs(entry.ttl as u64 / 2);
                if now.duration_since(entry.stored_at) >= half {
                    reannounce.push((id_key.key.clone(), entry.value.clone(), entry.ttl));
                }
            }
        }
        for (key, value, ttl) in reannounce {
            self.dht_put(now, key, value, ttl, false, self.id);
        }

        self.timers
            .schedule(now + REFRESH_INTERVAL, Timeout::DhtRefresh);
    }
}
