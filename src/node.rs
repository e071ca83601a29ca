//! The embeddable node handle.
//!
//! [`Node::open`] binds the UDP socket, spawns the driver task that owns
//! the protocol core, and hands back a cheap cloneable handle. Every
//! method is a message to that task; the answers come back on oneshot
//! channels, connection and datagram events through [`Node::events`].

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

use codec::id::NodeId;
use codec::Family;
use overlay::{NodeEvent, NodeState};

use crate::server::{channel, Command, Driver};

#[derive(Clone)]
pub struct Node {
    commands: UnboundedSender<Command>,
    id: Arc<RwLock<NodeId>>,
    events: Arc<Mutex<Option<UnboundedReceiver<NodeEvent>>>>,
    local_addr: SocketAddr,
}

impl Node {
    /// Bind `addr` and start the node. The address family of `addr` is
    /// the node's family; one node speaks exactly one.
    pub async fn open(addr: SocketAddr) -> std::io::Result<Node> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;

        let family = if local_addr.is_ipv6() {
            Family::Inet6
        } else {
            Family::Inet
        };

        let state = NodeState::new(family);
        let id = Arc::new(RwLock::new(state.id()));

        let (commands, rx) = channel();
        let (events_tx, events_rx) = unbounded_channel();

        let driver = Driver::new(socket, state, rx, &commands, events_tx);
        tokio::spawn(driver.run());

        Ok(Node {
            commands,
            id,
            events: Arc::new(Mutex::new(Some(events_rx))),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn id(&self) -> NodeId {
        *self.id.read()
    }

    /// Take the event stream: datagram deliveries, RDP connection
    /// events, NAT state changes. Yields `None` after the first call.
    pub fn events(&self) -> Option<UnboundedReceiver<NodeEvent>> {
        self.events.lock().take()
    }

    /// Declare this node globally reachable, skipping NAT detection.
    pub fn set_global(&self) {
        let _ = self.commands.send(Command::SetGlobal);
    }

    /// Override the random self identifier; input is padded or
    /// truncated to 20 bytes. Call before `join`.
    pub async fn set_id(&self, bytes: &[u8]) -> NodeId {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::SetId(bytes.to_vec(), tx));

        match rx.await {
            Ok(id) => {
                *self.id.write() = id;
                id
            }
            Err(_) => self.id(),
        }
    }

    /// Bootstrap against a seed endpoint; resolves once the first
    /// lookup completes (or fails).
    pub async fn join(&self, seed: SocketAddr) -> bool {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Join { seed, reply: tx });
        rx.await.unwrap_or(false)
    }

    /// Store `value` under `key` with a TTL in seconds. With `unique`,
    /// a later put from this node replaces the earlier value instead of
    /// accumulating.
    pub fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>, ttl: u16, unique: bool) {
        let _ = self.commands.send(Command::Put {
            key: key.into(),
            value: value.into(),
            ttl,
            unique,
        });
    }

    /// Fetch every value stored under `key`; `None` means the lookup
    /// failed to find any.
    pub async fn get(&self, key: impl Into<Bytes>) -> Option<Vec<Bytes>> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Get {
            key: key.into(),
            reply: tx,
        });
        rx.await.unwrap_or(None)
    }

    /// Best-effort datagram to an identifier.
    pub fn send_dgram(&self, data: impl Into<Bytes>, dst: NodeId) {
        let _ = self.commands.send(Command::Dgram {
            data: data.into(),
            dst,
        });
    }

    /// Passive-open an RDP port. Connection events arrive on the event
    /// stream; `None` when the port is taken.
    pub async fn rdp_listen(&self, port: u16) -> Option<i32> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::RdpListen { port, reply: tx });
        rx.await.ok().flatten()
    }

    /// Active-open a connection to `did:dport`. `sport` zero draws an
    /// ephemeral port. CONNECTED / REFUSED / FAILED arrive on the event
    /// stream.
    pub async fn rdp_connect(&self, sport: u16, did: NodeId, dport: u16) -> Option<i32> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::RdpConnect {
            sport,
            did,
            dport,
            reply: tx,
        });
        rx.await.ok().flatten()
    }

    /// Queue bytes on a connection; returns how many were accepted by
    /// the send window.
    pub async fn rdp_send(&self, desc: i32, data: impl Into<Bytes>) -> usize {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::RdpSend {
            desc,
            data: data.into(),
            reply: tx,
        });
        rx.await.unwrap_or(0)
    }

    /// Drain whatever in-order bytes the connection has buffered.
    pub async fn rdp_receive(&self, desc: i32) -> Vec<u8> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::RdpReceive { desc, reply: tx });
        rx.await.unwrap_or_default()
    }

    pub fn rdp_close(&self, desc: i32) {
        let _ = self.commands.send(Command::RdpClose { desc });
    }
}
