//! Outbound datagram queue.
//!
//! Engines never touch the socket; they push complete datagrams here and
//! the driver flushes the queue after every callback.

use std::net::SocketAddr;

use bytes::Bytes;

#[derive(Debug, Default)]
pub struct Outbox {
    queue: Vec<(SocketAddr, Bytes)>,
}

impl Outbox {
    pub fn push(&mut self, to: SocketAddr, datagram: impl Into<Bytes>) {
        self.queue.push((to, datagram.into()));
    }

    pub fn drain(&mut self) -> Vec<(SocketAddr, Bytes)> {
        std::mem::take(&mut self.queue)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
