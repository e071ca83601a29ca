//! ## Warren overlay engines
//!
//! The protocol core of a warren node, free of I/O. Everything here is
//! plain state mutated from a single task: the socket driver feeds
//! datagrams into [`NodeState::handle_datagram`], fires due timers through
//! [`NodeState::run_due`], and flushes whatever the engines queued —
//! outbound datagrams from the [`outbox`], user-facing [`NodeEvent`]s, and
//! the occasional [`DriverCmd`] (the NAT classifier needs a second,
//! short-lived probe socket that only the driver can bind).
//!
//! The engines:
//!
//! - [`peers`] — the identifier ⇄ endpoint directory with freshness and a
//!   timeout blacklist
//! - [`routing`] + [`lookup`] — k-buckets and the iterative lookup engine
//!   shared by both Kademlia realms
//! - [`nat`] — reachability classification (global / cone / symmetric)
//! - [`dtun`] — the rendezvous realm: identifier → current endpoint
//! - [`dht`] — the storage realm: key → values with TTL
//! - [`advertise`] — opportunistic reverse routing hints
//! - [`proxy`] — relay registration and forwarding for NATed nodes
//! - [`dgram`] — best-effort datagrams with resolve-then-transmit queues
//! - [`rdp`] — the reliable, ordered, connection-oriented transport

pub mod advertise;
pub mod dgram;
pub mod dht;
pub mod dtun;
pub mod lookup;
pub mod nat;
pub mod node;
pub mod outbox;
pub mod peers;
pub mod proxy;
pub mod rdp;
pub mod routing;
pub mod timer;

use std::net::SocketAddr;

use bytes::Bytes;

use codec::id::NodeId;

pub use crate::nat::NatState;
pub use crate::node::{DriverCmd, NodeState};
pub use crate::rdp::{RdpAddr, RdpEvent, RdpState};

/// Which Kademlia instance a message or timer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Realm {
    Dtun,
    Dht,
}

/// A node descriptor: identifier plus endpoint.
///
/// `addr = None` is the loopback sentinel a node uses for itself in a
/// node list; callers that must contact a remote node filter it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAddr {
    pub id: NodeId,
    pub addr: Option<SocketAddr>,
}

/// Events surfaced to the embedding application.
#[derive(Debug)]
pub enum NodeEvent {
    /// A bootstrap `join` finished.
    JoinDone { op: u64, ok: bool },
    /// A `get` finished; `None` means the lookup failed outright.
    GetDone { op: u64, values: Option<Vec<Bytes>> },
    /// An application datagram arrived.
    Dgram { from: NodeId, data: Bytes },
    /// An RDP connection event.
    Rdp {
        desc: i32,
        addr: RdpAddr,
        event: RdpEvent,
    },
    /// The NAT classifier reached a new state.
    NatState { state: NatState },
}
