//! k-bucket routing table.
//!
//! 160 buckets indexed by the XOR-MSB distance from the local identifier,
//! each holding up to [`K`] node descriptors ordered least-recently-seen
//! first. A full bucket never evicts eagerly: the oldest incumbent is
//! pinged and only replaced when the ping times out, which keeps
//! long-lived nodes in the table — they are the ones most likely to still
//! be there tomorrow.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use rand::Rng;

use codec::id::NodeId;

use crate::timer::{Timeout, Timers};
use crate::{NodeAddr, Realm};

/// Bucket capacity.
pub const K: usize = 20;

/// How long a bucket-eviction ping may go unanswered.
pub const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Instruction to the caller: ping this incumbent with this nonce.
#[derive(Debug, Clone, Copy)]
pub struct PingRequest {
    pub incumbent: NodeAddr,
    pub nonce: u32,
}

#[derive(Debug)]
struct PingWait {
    bucket: usize,
    incumbent: NodeAddr,
    candidate: NodeAddr,
    timer: u64,
}

#[derive(Debug)]
pub struct RoutingTable {
    realm: Realm,
    buckets: HashMap<usize, VecDeque<NodeAddr>>,
    ping_wait: HashMap<u32, PingWait>,
    pinged_buckets: HashSet<usize>,
}

impl RoutingTable {
    pub fn new(realm: Realm) -> Self {
        Self {
            realm,
            buckets: HashMap::new(),
            ping_wait: HashMap::new(),
            pinged_buckets: HashSet::new(),
        }
    }

    pub fn has(&self, self_id: &NodeId, id: &NodeId) -> bool {
        let Some(i) = self_id.bucket_index(id) else {
            return false;
        };
        self.buckets
            .get(&i)
            .is_some_and(|row| row.iter().any(|n| n.id == *id))
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|row| row.is_empty())
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(|row| row.len()).sum()
    }

    /// Offer a node to the table.
    ///
    /// Returns a [`PingRequest`] when the bucket is full and the oldest
    /// incumbent must prove it is still alive before the candidate may
    /// take its slot.
    pub fn add(
        &mut self,
        self_id: &NodeId,
        node: NodeAddr,
        now: Instant,
        timers: &mut Timers,
    ) -> Option<PingRequest> {
        let addr = node.addr?;
        let i = self_id.bucket_index(&node.id)?;

        let row = self.buckets.entry(i).or_default();

        if let Some(pos) = row.iter().position(|n| n.id == node.id) {
            // already known: move to the most-recently-seen end
            row.remove(pos);
            row.push_back(NodeAddr {
                id: node.id,
                addr: Some(addr),
            });
            return None;
        }

        if row.len() < K {
            row.push_back(node);
            return None;
        }

        if self.pinged_buckets.contains(&i) {
            // an eviction is already being decided for this bucket
            return None;
        }

        let incumbent = *row.front().expect("full bucket has a front");

        let mut rng = rand::rng();
        let nonce = loop {
            let nonce: u32 = rng.random();
            if !self.ping_wait.contains_key(&nonce) {
                break nonce;
            }
        };

        let timer = timers.schedule(
            now + PING_TIMEOUT,
            Timeout::BucketPing {
                realm: self.realm,
                nonce,
            },
        );

        self.pinged_buckets.insert(i);
        self.ping_wait.insert(
            nonce,
            PingWait {
                bucket: i,
                incumbent,
                candidate: node,
                timer,
            },
        );

        Some(PingRequest { incumbent, nonce })
    }

    /// The pinged incumbent answered: it stays, the candidate is dropped.
    pub fn on_ping_reply(
        &mut self,
        nonce: u32,
        src_id: &NodeId,
        src_addr: std::net::SocketAddr,
        timers: &mut Timers,
    ) {
        let Some(wait) = self.ping_wait.get(&nonce) else {
            return;
        };

        if wait.incumbent.id != *src_id || wait.incumbent.addr != Some(src_addr) {
            return;
        }

        let wait = self.ping_wait.remove(&nonce).expect("checked above");
        timers.cancel(wait.timer);
        self.pinged_buckets.remove(&wait.bucket);

        if let Some(row) = self.buckets.get_mut(&wait.bucket) {
            if let Some(pos) = row.iter().position(|n| n.id == wait.incumbent.id) {
                let incumbent = row.remove(pos).expect("position just found");
                row.push_back(incumbent);
            }
        }
    }

    /// The pinged incumbent stayed silent: evict it, seat the candidate.
    ///
    /// Returns the evicted identifier so the caller can blacklist it.
    pub fn on_ping_timeout(&mut self, nonce: u32) -> Option<NodeId> {
        let wait = self.ping_wait.remove(&nonce)?;
        self.pinged_buckets.remove(&wait.bucket);

        let row = self.buckets.get_mut(&wait.bucket)?;
        if let Some(pos) = row.iter().position(|n| n.id == wait.incumbent.id) {
            row.remove(pos);
        }
        if row.len() < K && !row.iter().any(|n| n.id == wait.candidate.id) {
            row.push_back(wait.candidate);
        }

        Some(wait.incumbent.id)
    }

    pub fn remove(&mut self, self_id: &NodeId, id: &NodeId) {
        let Some(i) = self_id.bucket_index(id) else {
            return;
        };
        if let Some(row) = self.buckets.get_mut(&i) {
            if let Some(pos) = row.iter().position(|n| n.id == *id) {
                row.remove(pos);
            }
            if row.is_empty() {
                self.buckets.remove(&i);
            }
        }
    }

    /// The `num` known nodes closest to `target` by XOR distance.
    ///
    /// When `target` is the local identifier the result includes a
    /// loopback self entry; callers that must contact a remote node
    /// filter it out.
    pub fn lookup(&self, self_id: &NodeId, target: &NodeId, num: usize) -> Vec<NodeAddr> {
        let mut picked: HashSet<isize> = HashSet::new();

        let found = self.walk_toward(self_id, target, num, &mut picked);
        if found < num {
            self.walk_rest(self_id, target, num - found, &mut picked);
        }

        let mut out: Vec<NodeAddr> = Vec::new();
        for i in picked {
            if i < 0 {
                out.push(NodeAddr {
                    id: *self_id,
                    addr: None,
                });
            } else if let Some(row) = self.buckets.get(&(i as usize)) {
                out.extend(row.iter().copied());
            }
        }

        out.sort_by_key(|n| n.id.distance(target));
        out.truncate(num);
        out
    }

    /// Walk buckets in decreasing relevance by clearing the most
    /// significant differing bit of `target` relative to self, one per
    /// step. Inserts `-1` when the walk reaches self.
    fn walk_toward(
        &self,
        self_id: &NodeId,
        target: &NodeId,
        num: usize,
        picked: &mut HashSet<isize>,
    ) -> usize {
        let mut cursor = *target;
        let mut n = 0;

        while n < num {
            let d = self_id.distance(&cursor);
            if d.is_zero() {
                picked.insert(-1);
                n += 1;
                break;
            }

            let i = self_id.bucket_index(&cursor).expect("distance is nonzero");
            if let Some(row) = self.buckets.get(&i) {
                if !row.is_empty() && picked.insert(i as isize) {
                    n += row.len();
                }
            }

            cursor = cursor ^ NodeId::from_bit(i);
        }

        n
    }

    /// Cover whatever the directed walk skipped: buckets at positions
    /// where self and target agree.
    fn walk_rest(
        &self,
        self_id: &NodeId,
        target: &NodeId,
        num: usize,
        picked: &mut HashSet<isize>,
    ) -> usize {
        let agreeing = !(self_id.distance(target));
        let mut indices: Vec<usize> = self.buckets.keys().copied().collect();
        indices.sort_unstable();

        let mut n = 0;
        for i in indices {
            if n >= num {
                break;
            }
            let bit = NodeId::from_bit(i);
            if !(agreeing & bit).is_zero() && picked.insert(i as isize) {
                n += self.buckets[&i].len();
            }
        }

        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(i: usize, port: u16) -> NodeAddr {
        NodeAddr {
            id: NodeId::from_bit(i),
            addr: Some(format!("127.0.0.1:{port}").parse().unwrap()),
        }
    }

    #[test]
    fn entries_land_in_their_xor_bucket() {
        let self_id = NodeId::ZERO;
        let mut timers = Timers::new();
        let mut table = RoutingTable::new(Realm::Dht);
        let now = Instant::now();

        for i in [0usize, 5, 31, 159] {
            table.add(&self_id, node(i, 1000 + i as u16), now, &mut timers);
        }

        for (i, row) in &table.buckets {
            for entry in row {
                assert_eq!(self_id.bucket_index(&entry.id), Some(*i));
            }
        }
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn self_is_never_inserted() {
        let self_id = NodeId::from_bit(3);
        let mut timers = Timers::new();
        let mut table = RoutingTable::new(Realm::Dht);

        let refused = table.add(
            &self_id,
            NodeAddr {
                id: self_id,
                addr: Some("127.0.0.1:1".parse().unwrap()),
            },
            Instant::now(),
            &mut timers,
        );

        assert!(refused.is_none());
        assert!(table.is_empty());
    }

    fn fill_bucket(
        table: &mut RoutingTable,
        self_id: &NodeId,
        timers: &mut Timers,
        now: Instant,
    ) -> Vec<NodeAddr> {
        // ids sharing bucket 159 relative to zero: top bit set
        let mut nodes = Vec::new();
        for n in 0..K {
            let mut bytes = [0u8; 20];
            bytes[0] = 0x80;
            bytes[19] = n as u8 + 1;
            let node = NodeAddr {
                id: NodeId::from_bytes(bytes),
                addr: Some(format!("127.0.0.1:{}", 5000 + n).parse().unwrap()),
            };
            assert!(table.add(self_id, node, now, timers).is_none());
            nodes.push(node);
        }
        nodes
    }

    #[test]
    fn full_bucket_pings_the_oldest() {
        let self_id = NodeId::ZERO;
        let mut timers = Timers::new();
        let mut table = RoutingTable::new(Realm::Dtun);
        let now = Instant::now();

        let nodes = fill_bucket(&mut table, &self_id, &mut timers, now);

        let mut bytes = [0u8; 20];
        bytes[0] = 0x80;
        bytes[19] = 0xff;
        let candidate = NodeAddr {
            id: NodeId::from_bytes(bytes),
            addr: Some("127.0.0.1:9999".parse().unwrap()),
        };

        let ping = table
            .add(&self_id, candidate, now, &mut timers)
            .expect("full bucket must trigger a ping");
        assert_eq!(ping.incumbent.id, nodes[0].id);

        // second candidate while the ping is in flight: dropped
        assert!(table.add(&self_id, candidate, now, &mut timers).is_none());

        // incumbent answers: candidate discarded, incumbent is now MRU
        table.on_ping_reply(
            ping.nonce,
            &nodes[0].id,
            nodes[0].addr.unwrap(),
            &mut timers,
        );
        assert!(table.has(&self_id, &nodes[0].id));
        assert!(!table.has(&self_id, &candidate.id));

        // a fresh candidate pings again; this time the incumbent stays
        // silent and is evicted
        let ping = table
            .add(&self_id, candidate, now, &mut timers)
            .expect("ping expected");
        assert_eq!(ping.incumbent.id, nodes[1].id);

        let evicted = table.on_ping_timeout(ping.nonce);
        assert_eq!(evicted, Some(nodes[1].id));
        assert!(!table.has(&self_id, &nodes[1].id));
        assert!(table.has(&self_id, &candidate.id));
    }

    #[test]
    fn lookup_returns_closest_sorted() {
        let self_id = NodeId::ZERO;
        let mut timers = Timers::new();
        let mut table = RoutingTable::new(Realm::Dht);
        let now = Instant::now();

        for i in 0..16 {
            table.add(&self_id, node(i * 10, 2000 + i as u16), now, &mut timers);
        }

        let target = NodeId::from_bit(50);
        let got = table.lookup(&self_id, &target, 4);

        assert_eq!(got.len(), 4);
        assert_eq!(got[0].id, NodeId::from_bit(50));
        for pair in got.windows(2) {
            assert!(pair[0].id.distance(&target) < pair[1].id.distance(&target));
        }

        // determinism: the same question gives the same answer
        assert_eq!(table.lookup(&self_id, &target, 4), got);
    }

    #[test]
    fn lookup_for_self_includes_loopback() {
        let self_id = NodeId::from_bit(100);
        let mut timers = Timers::new();
        let mut table = RoutingTable::new(Realm::Dtun);
        let now = Instant::now();

        table.add(&self_id, node(3, 3000), now, &mut timers);

        let got = table.lookup(&self_id, &self_id, 2);
        assert_eq!(got[0].id, self_id);
        assert_eq!(got[0].addr, None);
        assert_eq!(got.len(), 2);
    }
}
