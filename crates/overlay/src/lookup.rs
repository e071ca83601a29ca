//! Iterative lookup engine.
//!
//! Both Kademlia realms drive their find-node and find-value traffic
//! through this engine: a shortlist seeded from the routing table, up to
//! [`MAX_QUERY`] queries in flight, each armed with its own timer, replies
//! merged back into the shortlist until the closest [`K`](crate::routing::K)
//! responsive nodes are known or no queryable candidate remains.
//!
//! What happens with the final node set is encoded in the query's
//! [`LookupGoal`] — a plain enum rather than a stored closure, so the
//! continuation dispatch stays tabular and the whole engine is inert data
//! between callbacks.

use std::time::{Duration, Instant};

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use bytes::{Bytes, BytesMut};
use rand::Rng;

use codec::id::NodeId;
use codec::messages::{DhtFindValue, FindNode};
use codec::{MsgType, STATE_GLOBAL, STATE_NAT};

use crate::node::NodeState;
use crate::routing::K;
use crate::timer::Timeout;
use crate::{NodeAddr, Realm};

/// Outstanding find queries per lookup.
pub const MAX_QUERY: usize = 3;

/// How long a single find query may go unanswered.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupKind {
    FindNode,
    /// DTUN find-value resolves a registration; the DHT variant carries
    /// the exact key being fetched.
    FindValue { key: Option<Bytes> },
}

/// Continuation to run when a lookup completes.
#[derive(Debug, Clone)]
pub enum LookupGoal {
    /// A user-visible bootstrap join.
    Join { op: u64 },
    /// Seeding the tables after NAT detection; nothing to deliver.
    Refresh,
    /// Send DTUN registrations to the closest responders.
    DtunRegister,
    /// Send a store to the closest responders.
    DhtStore {
        key: Bytes,
        value: Bytes,
        ttl: u16,
        unique: bool,
        origin: NodeId,
    },
    /// A user-visible get.
    DhtGet { op: u64 },
    /// A get executed on behalf of a proxied registrant.
    ProxiedGet { nonce: u32, requester: NodeId },
    /// Resolving an identifier so queued datagrams can drain.
    Resolve { target: NodeId },
    /// Pick a proxy among the closest nodes and register with it.
    ProxyRegister,
}

/// What a finished lookup produced.
#[derive(Debug)]
pub enum LookupResult {
    /// The closest responsive nodes, ascending by XOR distance.
    Nodes(Vec<NodeAddr>),
    /// DTUN: the registered endpoint of the target, and the registrar
    /// that answered.
    Endpoint {
        endpoint: NodeAddr,
        registrar: NodeAddr,
    },
    /// DHT: the values stored under the key.
    Values(Vec<Bytes>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandState {
    New,
    Inflight,
    Done,
    Failed,
}

#[derive(Debug)]
struct Candidate {
    node: NodeAddr,
    state: CandState,
}

#[derive(Debug)]
pub struct Query {
    pub realm: Realm,
    pub kind: LookupKind,
    pub target: NodeId,
    pub goal: LookupGoal,
    candidates: Vec<Candidate>,
    seen: HashSet<NodeId>,
    inflight: HashMap<NodeId, u64>,
}

#[derive(Debug, Default)]
pub struct Lookups {
    queries: HashMap<u32, Query>,
}

impl Lookups {
    pub fn new() -> Self {
        Self {
            queries: HashMap::new(),
        }
    }

    fn unique_nonce(&self) -> u32 {
        let mut rng = rand::rng();
        loop {
            let nonce: u32 = rng.random();
            if !self.queries.contains_key(&nonce) {
                return nonce;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

impl NodeState {
    /// Begin an iterative lookup seeded from the realm's routing table.
    pub(crate) fn start_lookup(
        &mut self,
        now: Instant,
        realm: Realm,
        kind: LookupKind,
        target: NodeId,
        goal: LookupGoal,
    ) {
        let seeds = self.realm_table(realm).lookup(&self.id, &target, K);
        self.start_lookup_with(now, realm, kind, target, goal, seeds);
    }

    /// Begin a lookup against an explicit seed set (bootstrap join gives a
    /// bare endpoint whose identifier is not yet known).
    pub(crate) fn start_lookup_with(
        &mut self,
        now: Instant,
        realm: Realm,
        kind: LookupKind,
        target: NodeId,
        goal: LookupGoal,
        seeds: Vec<NodeAddr>,
    ) {
        let nonce = self.lookups.unique_nonce();

        let mut query = Query {
            realm,
            kind,
            target,
            goal,
            candidates: Vec::new(),
            seen: HashSet::new(),
            inflight: HashMap::new(),
        };
        query.seen.insert(self.id);

        for seed in seeds {
            if seed.addr.is_none() {
                continue; // the loopback self entry
            }
            if self.peers.is_timed_out(&seed.id) {
                continue;
            }
            if query.seen.insert(seed.id) {
                query.candidates.push(Candidate {
                    node: seed,
                    state: CandState::New,
                });
            }
        }

        self.lookups.queries.insert(nonce, query);
        self.lookup_step(now, nonce);
        self.lookup_try_finish(now, nonce);
    }

    /// Keep up to [`MAX_QUERY`] queries in flight.
    fn lookup_step(&mut self, now: Instant, nonce: u32) {
        loop {
            let Some(query) = self.lookups.queries.get_mut(&nonce) else {
                return;
            };
            if query.inflight.len() >= MAX_QUERY {
                return;
            }

            let Some(next) = query
                .candidates
                .iter_mut()
                .find(|c| c.state == CandState::New)
            else {
                return;
            };

            next.state = CandState::Inflight;
            let node = next.node;
            let realm = query.realm;
            let kind = query.kind.clone();
            let target = query.target;

            let timer = self.timers.schedule(
                now + QUERY_TIMEOUT,
                Timeout::Query {
                    realm,
                    nonce,
                    node: node.id,
                },
            );
            self.lookups
                .queries
                .get_mut(&nonce)
                .expect("query just seen")
                .inflight
                .insert(node.id, timer);

            self.send_find(realm, &kind, &target, nonce, &node);
        }
    }

    fn send_find(
        &mut self,
        realm: Realm,
        kind: &LookupKind,
        target: &NodeId,
        nonce: u32,
        node: &NodeAddr,
    ) {
        let addr = node.addr.expect("candidates always carry an endpoint");
        let mut buf = BytesMut::new();

        match (realm, kind) {
            (Realm::Dht, LookupKind::FindValue { key: Some(key) }) => {
                DhtFindValue {
                    nonce,
                    target: *target,
                    family: self.family,
                    key: key.clone(),
                }
                .encode(&self.id, &node.id, &mut buf);
            }
            _ => {
                let (msg_kind, state) = match (realm, kind) {
                    (Realm::Dtun, LookupKind::FindNode) => {
                        (MsgType::DtunFindNode, self.wire_state())
                    }
                    (Realm::Dtun, LookupKind::FindValue { .. }) => {
                        (MsgType::DtunFindValue, self.wire_state())
                    }
                    (Realm::Dht, _) => (MsgType::DhtFindNode, 0),
                };
                FindNode {
                    nonce,
                    target: *target,
                    family: self.family,
                    state,
                }
                .encode(msg_kind, &self.id, &node.id, &mut buf);
            }
        }

        self.outbox.push(addr, buf.freeze());
    }

    pub(crate) fn wire_state(&self) -> u16 {
        if self.reachable_globally() {
            STATE_GLOBAL
        } else {
            STATE_NAT
        }
    }

    /// A find reply arrived: merge the returned nodes into the shortlist.
    pub(crate) fn lookup_nodes_received(
        &mut self,
        now: Instant,
        nonce: u32,
        from: &NodeId,
        nodes: Vec<NodeAddr>,
    ) {
        if !self.lookup_complete_inflight(nonce, from) {
            return;
        }

        let Some(query) = self.lookups.queries.get_mut(&nonce) else {
            return;
        };
        let target = query.target;

        for node in nodes {
            if node.addr.is_none() || node.id.is_zero() {
                continue;
            }
            if self.peers.is_timed_out(&node.id) {
                continue;
            }
            if !query.seen.insert(node.id) {
                continue;
            }
            query.candidates.push(Candidate {
                node,
                state: CandState::New,
            });
        }

        // closest K first; drop surplus candidates that are neither
        // in flight nor already queried
        query
            .candidates
            .sort_by_key(|c| c.node.id.distance(&target));
        if query.candidates.len() > K {
            let mut kept = 0;
            query.candidates.retain(|c| {
                kept += 1;
                kept <= K || c.state != CandState::New
            });
        }

        self.lookup_step(now, nonce);
        self.lookup_try_finish(now, nonce);
    }

    /// DTUN find-value hit: the registered endpoint of the target.
    pub(crate) fn lookup_endpoint_received(
        &mut self,
        now: Instant,
        nonce: u32,
        from: &NodeId,
        from_addr: std::net::SocketAddr,
        endpoint: NodeAddr,
    ) {
        if !self.lookup_complete_inflight(nonce, from) {
            return;
        }
        self.lookup_abort_with(
            now,
            nonce,
            LookupResult::Endpoint {
                endpoint,
                registrar: NodeAddr {
                    id: *from,
                    addr: Some(from_addr),
                },
            },
        );
    }

    /// DHT find-value hit: values stored under the key.
    pub(crate) fn lookup_values_received(
        &mut self,
        now: Instant,
        nonce: u32,
        from: &NodeId,
        values: Vec<Bytes>,
    ) {
        if !self.lookup_complete_inflight(nonce, from) {
            return;
        }
        self.lookup_abort_with(now, nonce, LookupResult::Values(values));
    }

    /// A single find query timed out.
    pub(crate) fn on_query_timeout(&mut self, now: Instant, nonce: u32, node: NodeId) {
        let Some(query) = self.lookups.queries.get_mut(&nonce) else {
            return;
        };

        query.inflight.remove(&node);
        if let Some(c) = query.candidates.iter_mut().find(|c| c.node.id == node) {
            c.state = CandState::Failed;
        }
        if !node.is_zero() {
            self.peers.mark_timeout(now, node);
        }

        self.lookup_step(now, nonce);
        self.lookup_try_finish(now, nonce);
    }

    /// Mark the query to `from` answered and cancel its timer. Returns
    /// false when the reply matches no in-flight query (late or forged).
    fn lookup_complete_inflight(&mut self, nonce: u32, from: &NodeId) -> bool {
        let Some(query) = self.lookups.queries.get_mut(&nonce) else {
            return false;
        };

        // a bootstrap seed was queried before its identifier was known
        let key = if query.inflight.contains_key(from) {
            *from
        } else if query.inflight.contains_key(&NodeId::ZERO) {
            NodeId::ZERO
        } else {
            return false;
        };

        let timer = query.inflight.remove(&key).expect("key just checked");
        self.timers.cancel(timer);

        let Some(query) = self.lookups.queries.get_mut(&nonce) else {
            return false;
        };
        if let Some(c) = query
            .candidates
            .iter_mut()
            .find(|c| c.node.id == key || c.node.id == *from)
        {
            c.state = CandState::Done;
            c.node.id = *from;
        }
        query.seen.insert(*from);

        true
    }

    fn lookup_try_finish(&mut self, now: Instant, nonce: u32) {
        let Some(query) = self.lookups.queries.get(&nonce) else {
            return;
        };

        let queryable = query
            .candidates
            .iter()
            .any(|c| c.state == CandState::New || c.state == CandState::Inflight);
        if queryable || !query.inflight.is_empty() {
            return;
        }

        let mut nodes: Vec<NodeAddr> = query
            .candidates
            .iter()
            .filter(|c| c.state == CandState::Done)
            .map(|c| c.node)
            .collect();
        let target = query.target;
        nodes.sort_by_key(|n| n.id.distance(&target));

        self.lookup_abort_with(now, nonce, LookupResult::Nodes(nodes));
    }

    fn lookup_abort_with(&mut self, now: Instant, nonce: u32, result: LookupResult) {
        let Some(query) = self.lookups.queries.remove(&nonce) else {
            return;
        };

        for (_, timer) in query.inflight.iter() {
            self.timers.cancel(*timer);
        }

        self.lookup_finished(now, query, result);
    }
}
