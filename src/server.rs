//! The socket driver.
//!
//! One task owns the UDP socket and the whole protocol core. Everything
//! funnels through a single `select!`: datagrams from the wire, commands
//! from [`Node`](crate::node::Node) handles, and the core's next timer
//! deadline. After every entry into the core the driver flushes what the
//! engines queued — outbound datagrams, user events, probe-socket
//! requests. The core never blocks and never touches the socket, so all
//! of its invariants hold under this one task.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use codec::id::NodeId;
use overlay::nat::ECHO_TIMEOUT;
use overlay::{DriverCmd, NodeEvent, NodeState};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{mpsc, oneshot};

pub(crate) enum Command {
    SetGlobal,
    SetId(Vec<u8>, oneshot::Sender<NodeId>),
    Join {
        seed: SocketAddr,
        reply: oneshot::Sender<bool>,
    },
    Put {
        key: Bytes,
        value: Bytes,
        ttl: u16,
        unique: bool,
    },
    Get {
        key: Bytes,
        reply: oneshot::Sender<Option<Vec<Bytes>>>,
    },
    Dgram {
        data: Bytes,
        dst: NodeId,
    },
    RdpListen {
        port: u16,
        reply: oneshot::Sender<Option<i32>>,
    },
    RdpConnect {
        sport: u16,
        did: NodeId,
        dport: u16,
        reply: oneshot::Sender<Option<i32>>,
    },
    RdpSend {
        desc: i32,
        data: Bytes,
        reply: oneshot::Sender<usize>,
    },
    RdpReceive {
        desc: i32,
        reply: oneshot::Sender<Vec<u8>>,
    },
    RdpClose {
        desc: i32,
    },
    ProbeOpened {
        nonce: u32,
        port: u16,
    },
    ProbeOutcome {
        nonce: u32,
        datagram: Option<Vec<u8>>,
    },
}

enum OpWaiter {
    Join(oneshot::Sender<bool>),
    Get(oneshot::Sender<Option<Vec<Bytes>>>),
}

enum Wake {
    Datagram(std::io::Result<(usize, SocketAddr)>),
    Command(Option<Command>),
    Timer,
}

pub(crate) struct Driver {
    socket: Arc<UdpSocket>,
    state: NodeState,
    commands: UnboundedReceiver<Command>,
    /// Handed to probe tasks so their results come back through the
    /// same single-threaded funnel. Weak, so a driver whose handles are
    /// all gone still shuts down.
    internal: mpsc::WeakUnboundedSender<Command>,
    events: UnboundedSender<NodeEvent>,
    ops: HashMap<u64, OpWaiter>,
    next_op: u64,
}

impl Driver {
    pub(crate) fn new(
        socket: Arc<UdpSocket>,
        state: NodeState,
        commands: UnboundedReceiver<Command>,
        internal: &UnboundedSender<Command>,
        events: UnboundedSender<NodeEvent>,
    ) -> Self {
        Self {
            socket,
            state,
            commands,
            internal: internal.downgrade(),
            events,
            ops: HashMap::new(),
            next_op: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut buf = vec![0u8; 2048];

        self.state.start(Instant::now());
        self.flush().await;

        loop {
            let deadline = self.state.next_deadline();

            // resolve the wakeup first so the branch futures are gone
            // before the core is touched
            let wake = tokio::select! {
                received = self.socket.recv_from(&mut buf) => Wake::Datagram(received),
                command = self.commands.recv() => Wake::Command(command),
                _ = sleep_until_or_forever(deadline) => Wake::Timer,
            };

            match wake {
                Wake::Datagram(Ok((size, from))) => {
                    self.state.handle_datagram(Instant::now(), from, &buf[..size]);
                }
                Wake::Datagram(Err(err)) => {
                    // remote resets surface here on some platforms; the
                    // socket itself is fine
                    log::debug!("[server] recv error: {}", err);
                }
                Wake::Command(Some(command)) => self.handle_command(command),
                Wake::Command(None) => break, // every handle dropped
                Wake::Timer => self.state.run_due(Instant::now()),
            }

            self.flush().await;
        }
    }

    fn handle_command(&mut self, command: Command) {
        let now = Instant::now();

        match command {
            Command::SetGlobal => self.state.set_global(),
            Command::SetId(bytes, reply) => {
                self.state.set_id(&bytes);
                let _ = reply.send(self.state.id());
            }
            Command::Join { seed, reply } => {
                let op = self.next_op;
                self.next_op += 1;
                self.ops.insert(op, OpWaiter::Join(reply));
                self.state.join(now, seed, op);
            }
            Command::Put {
                key,
                value,
                ttl,
                unique,
            } => self.state.put(now, key, value, ttl, unique),
            Command::Get { key, reply } => {
                let op = self.next_op;
                self.next_op += 1;
                self.ops.insert(op, OpWaiter::Get(reply));
                self.state.get(now, key, op);
            }
            Command::Dgram { data, dst } => self.state.dgram(now, &data, dst),
            Command::RdpListen { port, reply } => {
                let _ = reply.send(self.state.rdp_listen(port));
            }
            Command::RdpConnect {
                sport,
                did,
                dport,
                reply,
            } => {
                let _ = reply.send(self.state.rdp_connect(now, sport, did, dport));
            }
            Command::RdpSend { desc, data, reply } => {
                let _ = reply.send(self.state.rdp_send(now, desc, &data));
            }
            Command::RdpReceive { desc, reply } => {
                let _ = reply.send(self.state.rdp_receive(desc));
            }
            Command::RdpClose { desc } => self.state.rdp_close(now, desc),
            Command::ProbeOpened { nonce, port } => self.state.probe_opened(nonce, port),
            Command::ProbeOutcome { nonce, datagram } => {
                self.state.probe_outcome(now, nonce, datagram.as_deref());
            }
        }
    }

    /// Drain everything the core queued during the last callback.
    async fn flush(&mut self) {
        for (to, datagram) in self.state.take_outbound() {
            if let Err(err) = self.socket.send_to(&datagram, to).await {
                log::debug!("[server] send to {} failed: {}", to, err);
            }
        }

        for cmd in self.state.take_driver_cmds() {
            match cmd {
                DriverCmd::OpenProbe { nonce } => self.spawn_probe(nonce),
            }
        }

        for event in self.state.take_events() {
            match event {
                NodeEvent::JoinDone { op, ok } => {
                    if let Some(OpWaiter::Join(reply)) = self.ops.remove(&op) {
                        let _ = reply.send(ok);
                    }
                }
                NodeEvent::GetDone { op, values } => {
                    if let Some(OpWaiter::Get(reply)) = self.ops.remove(&op) {
                        let _ = reply.send(values);
                    }
                }
                other => {
                    let _ = self.events.send(other);
                }
            }
        }
    }

    /// Bind a short-lived socket for the NAT redirect probe and wait for
    /// at most one datagram on it; the outcome funnels back in as a
    /// command.
    fn spawn_probe(&self, nonce: u32) {
        let internal = self.internal.clone();
        let bind_addr: SocketAddr = match self.socket.local_addr() {
            Ok(addr) if addr.is_ipv6() => "[::]:0".parse().expect("probe bind address"),
            _ => "0.0.0.0:0".parse().expect("probe bind address"),
        };

        tokio::spawn(async move {
            let report = |command: Command| {
                if let Some(sender) = internal.upgrade() {
                    let _ = sender.send(command);
                }
            };

            let socket = match UdpSocket::bind(bind_addr).await {
                Ok(socket) => socket,
                Err(err) => {
                    log::debug!("[server] probe bind failed: {}", err);
                    report(Command::ProbeOutcome {
                        nonce,
                        datagram: None,
                    });
                    return;
                }
            };

            let port = match socket.local_addr() {
                Ok(addr) => addr.port(),
                Err(_) => 0,
            };
            report(Command::ProbeOpened { nonce, port });

            let mut buf = vec![0u8; 2048];
            let datagram = match tokio::time::timeout(ECHO_TIMEOUT, socket.recv_from(&mut buf)).await
            {
                Ok(Ok((size, _))) => Some(buf[..size].to_vec()),
                _ => None,
            };

            report(Command::ProbeOutcome { nonce, datagram });
        });
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

pub(crate) fn channel() -> (UnboundedSender<Command>, UnboundedReceiver<Command>) {
    mpsc::unbounded_channel()
}
