//! One-shot timer facade.
//!
//! Every pending operation in the overlay is represented by a [`Timeout`]
//! variant sitting in this queue; the driver asks for the next deadline,
//! sleeps until it, and hands due entries back to the node. Cancellation
//! is by token — the heap may keep a stale entry, `pop_due` skips it.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use ahash::{HashMap, HashMapExt};

use codec::id::NodeId;

use crate::Realm;

/// Everything the overlay can be waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timeout {
    /// Jittered peer-directory sweep.
    PeerSweep,
    /// An echo probe went unanswered.
    NatEcho { nonce: u32 },
    /// Re-run NAT detection until a terminal state is reached.
    NatRetry,
    /// A bucket-eviction ping went unanswered.
    BucketPing { realm: Realm, nonce: u32 },
    /// A single find query within an iterative lookup went unanswered.
    Query {
        realm: Realm,
        nonce: u32,
        node: NodeId,
    },
    /// Periodic DTUN registration refresh.
    DtunRegister,
    /// Periodic DHT storage sweep and re-announce.
    DhtRefresh,
    /// Periodic advertise refresh.
    Advertise,
    /// Periodic proxy registration refresh (symmetric NAT only).
    ProxyRegister,
    /// A proxy registration attempt may be retried.
    ProxyRegisterGuard { nonce: u32 },
    /// RDP retransmission / delayed-ack tick.
    RdpTick,
}

#[derive(Debug, Default)]
pub struct Timers {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    pending: HashMap<u64, Timeout>,
    next_token: u64,
}

impl Timers {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: HashMap::new(),
            next_token: 0,
        }
    }

    /// Arm a one-shot timer; the returned token cancels it.
    pub fn schedule(&mut self, at: Instant, timeout: Timeout) -> u64 {
        let token = self.next_token;
        self.next_token += 1;

        self.heap.push(Reverse((at, token)));
        self.pending.insert(token, timeout);

        token
    }

    pub fn cancel(&mut self, token: u64) -> Option<Timeout> {
        self.pending.remove(&token)
    }

    /// Earliest armed deadline, if any.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        // drop cancelled heads so the driver does not wake up for nothing
        while let Some(Reverse((at, token))) = self.heap.peek().copied() {
            if self.pending.contains_key(&token) {
                return Some(at);
            }
            let _ = self.heap.pop();
        }
        None
    }

    /// Take the next timer due at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<Timeout> {
        while let Some(Reverse((at, token))) = self.heap.peek().copied() {
            if at > now {
                return None;
            }
            let _ = self.heap.pop();
            if let Some(timeout) = self.pending.remove(&token) {
                return Some(timeout);
            }
        }
        None
    }

    #[cfg(test)]
    pub fn armed(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fires_in_deadline_order() {
        let mut timers = Timers::new();
        let base = Instant::now();

        timers.schedule(base + Duration::from_secs(2), Timeout::PeerSweep);
        timers.schedule(base + Duration::from_secs(1), Timeout::RdpTick);

        assert_eq!(timers.pop_due(base), None);
        assert_eq!(
            timers.pop_due(base + Duration::from_secs(3)),
            Some(Timeout::RdpTick)
        );
        assert_eq!(
            timers.pop_due(base + Duration::from_secs(3)),
            Some(Timeout::PeerSweep)
        );
        assert_eq!(timers.pop_due(base + Duration::from_secs(3)), None);
    }

    #[test]
    fn cancelled_timers_never_fire() {
        let mut timers = Timers::new();
        let base = Instant::now();

        let token = timers.schedule(base, Timeout::NatEcho { nonce: 1 });
        timers.schedule(base + Duration::from_millis(10), Timeout::NatRetry);

        assert_eq!(timers.cancel(token), Some(Timeout::NatEcho { nonce: 1 }));
        assert_eq!(
            timers.pop_due(base + Duration::from_secs(1)),
            Some(Timeout::NatRetry)
        );
        assert_eq!(timers.pop_due(base + Duration::from_secs(1)), None);
    }

    #[test]
    fn next_deadline_skips_cancelled() {
        let mut timers = Timers::new();
        let base = Instant::now();

        let token = timers.schedule(base + Duration::from_secs(1), Timeout::PeerSweep);
        timers.schedule(base + Duration::from_secs(5), Timeout::DhtRefresh);

        timers.cancel(token);
        assert_eq!(timers.next_deadline(), Some(base + Duration::from_secs(5)));
    }
}
