//! Reliable Datagram Protocol.
//!
//! A connection-oriented, reliable, ordered transport addressed by
//! overlay identifier instead of IP: a connection is the 4-tuple
//! `(remote id, remote port, local port)` with 16-bit ports private to
//! this layer. The machinery is the classic reliable-datagram design:
//! SYN/ACK handshake with negotiated window parameters, sliding send
//! window with per-segment retransmission back-off, a circular receive
//! window delivering an exact in-order byte stream, cumulative plus
//! extended (out-of-order) acknowledgements, and an RST/FIN close
//! handshake, every retained control packet retransmitted until a 32 s
//! ceiling.
//!
//! The engine is sans-I/O: segments to transmit pile up in an output
//! queue addressed by identifier and the node ships them through the
//! datagram path like any other payload.

mod connection;

pub use connection::{MAX_SEG_DATA, RBUF_MAX_DEFAULT, RCV_MAX_DEFAULT};

use std::time::{Duration, Instant};

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use bytes::{Bytes, BytesMut};
use rand::Rng;

use codec::id::NodeId;
use codec::rdp::{
    put_control, Segment, FLAG_ACK, FLAG_EAK, FLAG_FIN, FLAG_NUL, FLAG_RST, FLAG_SYN,
};

use connection::{Connection, RetainedRst, RetainedSyn, RT_INITIAL};

/// Retransmission / delayed-ack tick cadence.
pub const TICK: Duration = Duration::from_millis(300);

/// Emit a pending ACK at latest this long after the data arrived.
pub const ACK_INTERVAL: Duration = Duration::from_millis(300);

/// Hard ceiling on the age of any unacknowledged packet.
pub const MAX_RETRANS_DEFAULT: Duration = Duration::from_secs(32);

/// Ports below this are reserved for listeners; the active-open side
/// draws its ephemeral ports above it.
pub const WELL_KNOWN_PORT_MAX: u16 = 1024;

/// Connection 4-tuple. Ports are RDP-level, unrelated to UDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RdpAddr {
    /// Remote identifier.
    pub did: NodeId,
    /// Remote port.
    pub dport: u16,
    /// Local port.
    pub sport: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdpState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Open,
    CloseWaitPasv,
    CloseWaitActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdpEvent {
    Accepted,
    Connected,
    Refused,
    Reset,
    Failed,
    Broken,
    Ready2Read,
}

#[derive(Debug)]
pub struct Rdp {
    descs: HashSet<i32>,
    /// Listening ports, both directions.
    listening: HashMap<u16, i32>,
    listening_desc: HashMap<i32, u16>,

    conns: HashMap<i32, Connection>,
    addr2desc: HashMap<RdpAddr, i32>,

    max_retrans: Duration,

    out: Vec<(NodeId, Bytes)>,
    events: Vec<(i32, RdpAddr, RdpEvent)>,
}

impl Rdp {
    pub fn new() -> Self {
        Self {
            descs: HashSet::new(),
            listening: HashMap::new(),
            listening_desc: HashMap::new(),
            conns: HashMap::new(),
            addr2desc: HashMap::new(),
            max_retrans: MAX_RETRANS_DEFAULT,
            out: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Shrink or stretch the retransmission ceiling (tests mostly).
    pub fn set_max_retrans(&mut self, ceiling: Duration) {
        self.max_retrans = ceiling;
    }

    pub fn max_retrans(&self) -> Duration {
        self.max_retrans
    }

    /// Segments waiting to be shipped, addressed by identifier.
    pub fn take_output(&mut self) -> Vec<(NodeId, Bytes)> {
        std::mem::take(&mut self.out)
    }

    pub fn take_events(&mut self) -> Vec<(i32, RdpAddr, RdpEvent)> {
        std::mem::take(&mut self.events)
    }

    pub fn state_of(&self, desc: i32) -> RdpState {
        if !self.descs.contains(&desc) {
            return RdpState::Closed;
        }
        if self.listening_desc.contains_key(&desc) {
            return RdpState::Listen;
        }
        self.conns
            .get(&desc)
            .map(|c| c.state)
            .unwrap_or(RdpState::Closed)
    }

    fn generate_desc(&self) -> i32 {
        let mut rng = rand::rng();
        loop {
            let desc = rng.random_range(1..i32::MAX);
            if !self.descs.contains(&desc) {
                return desc;
            }
        }
    }

    fn output(&mut self, did: NodeId, segment: Bytes) {
        self.out.push((did, segment));
    }

    fn send_control(&mut self, addr: &RdpAddr, flags: u8, seqnum: u32, acknum: u32) {
        let mut buf = BytesMut::new();
        put_control(&mut buf, flags, addr.sport, addr.dport, seqnum, acknum);
        self.output(addr.did, buf.freeze());
    }

    fn dealloc(&mut self, desc: i32) {
        self.descs.remove(&desc);
        if let Some(con) = self.conns.remove(&desc) {
            self.addr2desc.remove(&con.addr);
        }
    }

    /// Passive open: register a listening port.
    pub fn listen(&mut self, sport: u16) -> Option<i32> {
        if self.listening.contains_key(&sport) {
            return None;
        }

        let desc = self.generate_desc();
        self.descs.insert(desc);
        self.listening.insert(sport, desc);
        self.listening_desc.insert(desc, sport);
        Some(desc)
    }

    /// Active open. A zero `sport` draws a random port above the
    /// well-known range, re-rolled on collision with an existing tuple.
    pub fn connect(&mut self, sport: u16, did: NodeId, dport: u16, now: Instant) -> Option<i32> {
        let mut addr = RdpAddr { did, dport, sport };

        if sport != 0 {
            if self.addr2desc.contains_key(&addr) {
                return None;
            }
        } else {
            let mut rng = rand::rng();
            loop {
                addr.sport = rng.random::<u16>();
                if addr.sport < WELL_KNOWN_PORT_MAX {
                    continue;
                }
                if !self.addr2desc.contains_key(&addr) {
                    break;
                }
            }
        }

        let desc = self.generate_desc();
        let mut con = Connection::new(addr, desc, false, now);
        con.state = RdpState::SynSent;
        con.snd_iss = rand::rng().random();
        con.snd_nxt = con.snd_iss.wrapping_add(1);
        con.snd_una = con.snd_iss;
        con.syn = Some(RetainedSyn {
            flags: FLAG_SYN,
            started: now,
            time: now,
            tout: RT_INITIAL,
        });

        let syn = con.encode_syn(FLAG_SYN);
        self.descs.insert(desc);
        self.addr2desc.insert(addr, desc);
        self.conns.insert(desc, con);
        self.output(did, syn);

        Some(desc)
    }

    /// Slice `buf` into segments and enqueue as many as the send window
    /// accepts. Returns the number of bytes taken.
    pub fn send(&mut self, desc: i32, buf: &[u8], now: Instant) -> usize {
        let Some(con) = self.conns.get_mut(&desc) else {
            return 0;
        };
        if con.state != RdpState::Open {
            return 0;
        }

        let mut total = 0;
        let mut rest = buf;
        let mut segs = Vec::new();

        while !rest.is_empty() {
            let take = rest.len().min(MAX_SEG_DATA).min(con.sbuf_max as usize);
            if take == 0 {
                break;
            }
            if !con.enqueue_swnd(Bytes::copy_from_slice(&rest[..take]), now) {
                break;
            }
            // transmit as we go so the unsent cursor never hides behind
            // a completely filled ring
            con.send_outstanding(now, &mut segs);
            total += take;
            rest = &rest[take..];
        }

        let did = con.addr.did;
        for seg in segs {
            self.out.push((did, seg));
        }

        total
    }

    /// Drain the in-order read queue.
    pub fn receive(&mut self, desc: i32) -> Vec<u8> {
        let Some(con) = self.conns.get_mut(&desc) else {
            return Vec::new();
        };

        let mut data = Vec::new();
        while let Some(chunk) = con.rqueue.pop_front() {
            data.extend_from_slice(&chunk);
        }
        data
    }

    pub fn close(&mut self, desc: i32, now: Instant) {
        if let Some(port) = self.listening_desc.remove(&desc) {
            self.listening.remove(&port);
            self.descs.remove(&desc);
            return;
        }

        let Some(con) = self.conns.get_mut(&desc) else {
            return;
        };

        match con.state {
            RdpState::Open => {
                con.state = RdpState::CloseWaitActive;
                con.is_closed = true;
                con.rst = Some(RetainedRst {
                    flags: FLAG_RST,
                    seqnum: con.snd_nxt,
                    started: now,
                    time: now,
                    tout: RT_INITIAL,
                    retry: true,
                });

                let (addr, seq) = (con.addr, con.snd_nxt);
                self.send_control(&addr, FLAG_RST, seq, 0);
            }
            RdpState::CloseWaitPasv => {
                con.is_closed = true;
            }
            RdpState::Closed => {
                self.dealloc(desc);
            }
            RdpState::SynSent | RdpState::SynRcvd => {
                let (addr, seq) = (con.addr, con.snd_nxt);
                self.send_control(&addr, FLAG_RST, seq, 0);
                self.dealloc(desc);
            }
            _ => {}
        }
    }

    /// Feed one received segment into the state machine.
    pub fn input(&mut self, src: NodeId, payload: &[u8], now: Instant) {
        let Ok(seg) = Segment::decode(payload) else {
            return;
        };

        let addr = RdpAddr {
            did: src,
            dport: seg.sport,
            sport: seg.dport,
        };

        match self.addr2desc.get(&addr).copied() {
            Some(desc) => {
                let state = self
                    .conns
                    .get(&desc)
                    .map(|c| c.state)
                    .unwrap_or(RdpState::Closed);
                match state {
                    RdpState::SynSent => self.in_state_syn_sent(desc, &seg, now),
                    RdpState::SynRcvd => self.in_state_syn_rcvd(desc, &seg, now),
                    RdpState::Open => self.in_state_open(desc, &seg, now),
                    RdpState::CloseWaitActive => self.in_state_close_wait_active(desc, &seg, now),
                    RdpState::CloseWaitPasv => self.in_state_close_wait_pasv(desc, &seg, now),
                    _ => self.in_state_closed(&addr, &seg),
                }
            }
            None => {
                if self.listening.contains_key(&addr.sport) {
                    self.in_state_listen(addr, &seg, now);
                } else {
                    self.in_state_closed(&addr, &seg);
                }
            }
        }
    }

    /// No connection record: answer so the peer tears down quickly.
    fn in_state_closed(&mut self, addr: &RdpAddr, seg: &Segment<'_>) {
        if seg.flags & FLAG_RST != 0 {
            return;
        }

        if seg.flags & (FLAG_ACK | FLAG_NUL) != 0 {
            self.send_control(addr, FLAG_RST, seg.acknum.wrapping_add(1), 0);
        } else {
            self.send_control(addr, FLAG_RST | FLAG_ACK, 0, seg.seqnum);
        }
    }

    fn in_state_listen(&mut self, addr: RdpAddr, seg: &Segment<'_>, now: Instant) {
        if seg.flags & FLAG_RST != 0 {
            return;
        }

        if seg.flags & (FLAG_ACK | FLAG_NUL) != 0 {
            self.send_control(&addr, FLAG_RST, seg.acknum.wrapping_add(1), 0);
            return;
        }

        if seg.flags & FLAG_SYN != 0 {
            let Some(syn) = seg.syn else {
                return;
            };

            let desc = self.generate_desc();
            let mut con = Connection::new(addr, desc, true, now);
            con.state = RdpState::SynRcvd;
            con.snd_iss = rand::rng().random();
            con.snd_nxt = con.snd_iss.wrapping_add(1);
            con.snd_una = con.snd_iss;
            con.rcv_cur = seg.seqnum;
            con.rcv_irs = seg.seqnum;
            con.rcv_ack = seg.seqnum;
            con.snd_max = syn.out_segs_max as u32;
            con.sbuf_max = syn.seg_size_max as u32;
            con.init_windows(now);
            con.acked_time = now;
            con.syn = Some(RetainedSyn {
                flags: FLAG_SYN | FLAG_ACK,
                started: now,
                time: now,
                tout: RT_INITIAL,
            });

            let syn_ack = con.encode_syn(FLAG_SYN | FLAG_ACK);
            self.descs.insert(desc);
            self.addr2desc.insert(addr, desc);
            self.conns.insert(desc, con);
            self.output(addr.did, syn_ack);
        }
    }

    fn in_state_syn_sent(&mut self, desc: i32, seg: &Segment<'_>, now: Instant) {
        let Some(con) = self.conns.get_mut(&desc) else {
            return;
        };
        let addr = con.addr;

        if seg.flags & FLAG_ACK != 0
            && seg.flags & FLAG_RST == 0
            && seg.acknum != con.snd_iss
        {
            self.send_control(&addr, FLAG_RST, seg.acknum.wrapping_add(1), 0);
            return;
        }

        if seg.flags & FLAG_RST != 0 {
            if seg.flags & FLAG_ACK != 0 {
                con.state = RdpState::Closed;
                con.syn = None;
                self.events.push((desc, addr, RdpEvent::Refused));
            }
            return;
        }

        if seg.flags & FLAG_SYN != 0 {
            let Some(syn) = seg.syn else {
                return;
            };

            con.rcv_cur = seg.seqnum;
            con.rcv_irs = seg.seqnum;
            con.rcv_ack = seg.seqnum;
            con.snd_max = syn.out_segs_max as u32;
            con.sbuf_max = syn.seg_size_max as u32;
            con.init_windows(now);
            con.acked_time = now;

            if seg.flags & FLAG_ACK != 0 {
                con.snd_una = seg.acknum;
                con.state = RdpState::Open;
                con.syn = None;

                let mut segs = Vec::new();
                con.plain_ack(now, &mut segs);
                for s in segs {
                    self.out.push((addr.did, s));
                }
                self.events.push((desc, addr, RdpEvent::Connected));
            } else {
                // simultaneous open
                con.state = RdpState::SynRcvd;
                con.syn = Some(RetainedSyn {
                    flags: FLAG_SYN | FLAG_ACK,
                    started: now,
                    time: now,
                    tout: RT_INITIAL,
                });
                let syn_ack = con.encode_syn(FLAG_SYN | FLAG_ACK);
                self.output(addr.did, syn_ack);
            }
        }
    }

    fn in_state_syn_rcvd(&mut self, desc: i32, seg: &Segment<'_>, now: Instant) {
        let Some(con) = self.conns.get_mut(&desc) else {
            return;
        };
        let addr = con.addr;

        // acceptance window is anchored at the initial receive sequence
        let seq_irs = seg.seqnum.wrapping_sub(con.rcv_irs);
        let bound = con
            .rcv_cur
            .wrapping_add(con.rcv_max * 2)
            .wrapping_sub(con.rcv_irs);
        if !(0 < seq_irs && seq_irs <= bound) {
            let mut segs = Vec::new();
            con.plain_ack(now, &mut segs);
            for s in segs {
                self.out.push((addr.did, s));
            }
            return;
        }

        if seg.flags & FLAG_RST != 0 {
            if con.is_pasv {
                self.dealloc(desc);
            } else {
                con.state = RdpState::Closed;
                con.syn = None;
                self.events.push((desc, addr, RdpEvent::Refused));
            }
            return;
        }

        if seg.flags & FLAG_SYN != 0 {
            con.state = RdpState::Closed;
            con.syn = None;
            self.send_control(&addr, FLAG_RST, seg.acknum.wrapping_add(1), 0);
            self.events.push((desc, addr, RdpEvent::Reset));
            self.dealloc(desc);
            return;
        }

        if seg.flags & FLAG_ACK != 0 {
            if seg.acknum != con.snd_iss {
                self.send_control(&addr, FLAG_RST, seg.acknum.wrapping_add(1), 0);
                return;
            }

            con.state = RdpState::Open;
            con.syn = None;
            let event = if con.is_pasv {
                RdpEvent::Accepted
            } else {
                RdpEvent::Connected
            };
            self.events.push((desc, addr, event));

            // data may ride on the very first ACK
            if !seg.payload.is_empty() {
                self.deliver_data(desc, seg, now);
            }
        }
    }

    fn in_state_open(&mut self, desc: i32, seg: &Segment<'_>, now: Instant) {
        let Some(con) = self.conns.get_mut(&desc) else {
            return;
        };
        let addr = con.addr;

        // If RCV.CUR < SEG.SEQ =< RCV.CUR + (RCV.MAX * 2): acceptable,
        // else answer with the current cursor and drop the segment.
        let seq_off = seg.seqnum.wrapping_sub(con.rcv_cur);
        if !(0 < seq_off && seq_off <= con.rcv_max * 2) {
            let mut segs = Vec::new();
            con.plain_ack(now, &mut segs);
            for s in segs {
                self.out.push((addr.did, s));
            }
            return;
        }

        if seg.flags & FLAG_RST != 0 {
            // passive close
            con.state = RdpState::CloseWaitPasv;
            con.rst = Some(RetainedRst {
                flags: FLAG_RST | FLAG_FIN,
                seqnum: con.snd_nxt,
                started: now,
                time: now,
                tout: RT_INITIAL,
                retry: true,
            });

            let seq = con.snd_nxt;
            self.send_control(&addr, FLAG_RST | FLAG_FIN, seq, 0);
            self.events.push((desc, addr, RdpEvent::Reset));
            return;
        }

        if seg.flags & FLAG_NUL != 0 {
            if !seg.payload.is_empty() {
                return;
            }
            self.deliver_data(desc, seg, now);
            return;
        }

        if seg.flags & FLAG_SYN != 0 {
            self.send_control(&addr, FLAG_RST, seg.acknum.wrapping_add(1), 0);
            let Some(con) = self.conns.get_mut(&desc) else {
                return;
            };
            con.state = RdpState::Closed;
            self.events.push((desc, addr, RdpEvent::Reset));
            return;
        }

        if seg.flags & FLAG_ACK != 0 {
            con.recv_ack(seg.acknum);
            let mut segs = Vec::new();
            con.send_outstanding(now, &mut segs);
            for s in segs {
                self.out.push((addr.did, s));
            }
        }

        if seg.flags & FLAG_EAK != 0 {
            let Some(con) = self.conns.get_mut(&desc) else {
                return;
            };
            for eak in &seg.eaks {
                con.recv_eack(*eak);
            }
            let mut segs = Vec::new();
            con.send_outstanding(now, &mut segs);
            for s in segs {
                self.out.push((addr.did, s));
            }
        }

        if !seg.payload.is_empty() {
            self.deliver_data(desc, seg, now);
        }
    }

    /// Insert a data (or NUL) segment into the receive window and fire
    /// the events its arrival warrants.
    fn deliver_data(&mut self, desc: i32, seg: &Segment<'_>, now: Instant) {
        let Some(con) = self.conns.get_mut(&desc) else {
            return;
        };
        let addr = con.addr;

        let (grew, ack_now) =
            con.rwnd_recv_data(Bytes::copy_from_slice(seg.payload), seg.seqnum);

        if ack_now {
            let mut segs = Vec::new();
            con.delayed_ack(now, &mut segs);
            for s in segs {
                self.out.push((addr.did, s));
            }
        }

        if grew {
            self.events.push((desc, addr, RdpEvent::Ready2Read));
        }
    }

    fn in_state_close_wait_active(&mut self, desc: i32, seg: &Segment<'_>, now: Instant) {
        let Some(con) = self.conns.get_mut(&desc) else {
            return;
        };
        let addr = con.addr;
        let _ = now;

        if seg.flags & FLAG_RST != 0 && seg.flags & FLAG_FIN != 0 {
            if let Some(rst) = con.rst.as_mut() {
                rst.retry = false;
            }
            let seq = con.snd_nxt;
            self.send_control(&addr, FLAG_FIN, seq, 0);
        }
    }

    fn in_state_close_wait_pasv(&mut self, desc: i32, seg: &Segment<'_>, now: Instant) {
        let Some(con) = self.conns.get_mut(&desc) else {
            return;
        };
        let addr = con.addr;

        if seg.flags & FLAG_FIN != 0 {
            if let Some(rst) = con.rst.as_mut() {
                rst.retry = false;
            }
        } else if seg.flags & FLAG_RST != 0 {
            if let Some(rst) = con.rst.as_mut() {
                rst.time = now;
                let (flags, seq) = (rst.flags, rst.seqnum);
                self.send_control(&addr, flags, seq, 0);
            }
        }
    }

    /// The periodic tick: handshake and close retransmission, data
    /// retransmission, delayed ACK emission, and reaping.
    pub fn tick(&mut self, now: Instant) {
        let descs: Vec<i32> = self.conns.keys().copied().collect();

        for desc in descs {
            let Some(con) = self.conns.get_mut(&desc) else {
                continue;
            };
            let addr = con.addr;

            match con.state {
                RdpState::SynSent | RdpState::SynRcvd => {
                    let Some(syn) = con.syn else {
                        continue;
                    };

                    if now.duration_since(syn.started) > self.max_retrans {
                        if con.is_pasv {
                            self.dealloc(desc);
                        } else {
                            con.state = RdpState::Closed;
                            con.syn = None;
                            self.events.push((desc, addr, RdpEvent::Failed));
                        }
                    } else if now.duration_since(syn.time) > syn.tout {
                        let retained = con.syn.as_mut().expect("checked above");
                        retained.time = now;
                        retained.tout *= 2;
                        let flags = retained.flags;
                        let packet = con.encode_syn(flags);
                        self.output(addr.did, packet);
                    }
                }
                RdpState::CloseWaitActive | RdpState::CloseWaitPasv => {
                    let Some(rst) = con.rst else {
                        continue;
                    };

                    if now.duration_since(rst.started) > self.max_retrans {
                        if con.is_closed {
                            self.dealloc(desc);
                        } else {
                            con.state = RdpState::Closed;
                        }
                    } else if now.duration_since(rst.time) > rst.tout && rst.retry {
                        let retained = con.rst.as_mut().expect("checked above");
                        retained.time = now;
                        retained.tout *= 2;
                        let (flags, seq) = (retained.flags, retained.seqnum);
                        self.send_control(&addr, flags, seq, 0);
                    }
                }
                RdpState::Open => {
                    let mut segs = Vec::new();
                    if !con.retransmit(now, self.max_retrans, &mut segs) {
                        con.state = RdpState::Closed;
                        self.events.push((desc, addr, RdpEvent::Broken));
                        continue;
                    }

                    if now.duration_since(con.acked_time) > ACK_INTERVAL {
                        con.delayed_ack(now, &mut segs);
                    }

                    for s in segs {
                        self.out.push((addr.did, s));
                    }
                }
                _ => {}
            }
        }
    }
}

impl Default for Rdp {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive two engines against each other, delivering every queued
    /// segment until both sides go quiet. `drop_nth` drops matching
    /// segments (1-based global count) and `dup` duplicates every third.
    fn pump(a: &mut Rdp, a_id: NodeId, b: &mut Rdp, b_id: NodeId, now: Instant, loss: bool) {
        let mut counter = 0u32;

        loop {
            let from_a = a.take_output();
            let from_b = b.take_output();
            if from_a.is_empty() && from_b.is_empty() {
                break;
            }

            for (did, seg) in from_a {
                assert_eq!(did, b_id);
                counter += 1;
                if loss && counter % 5 == 0 {
                    continue;
                }
                b.input(a_id, &seg, now);
                if loss && counter % 3 == 0 {
                    b.input(a_id, &seg, now);
                }
            }
            for (did, seg) in from_b {
                assert_eq!(did, a_id);
                counter += 1;
                if loss && counter % 5 == 0 {
                    continue;
                }
                a.input(b_id, &seg, now);
                if loss && counter % 3 == 0 {
                    a.input(b_id, &seg, now);
                }
            }
        }
    }

    fn ids() -> (NodeId, NodeId) {
        (NodeId::from_bit(1), NodeId::from_bit(2))
    }

    #[test]
    fn handshake_and_transfer() {
        let (a_id, b_id) = ids();
        let mut a = Rdp::new();
        let mut b = Rdp::new();
        let now = Instant::now();

        let listener = a.listen(100).unwrap();
        assert_eq!(a.state_of(listener), RdpState::Listen);

        let desc_b = b.connect(101, a_id, 100, now).unwrap();
        pump(&mut b, b_id, &mut a, a_id, now, false);

        let b_events = b.take_events();
        assert!(b_events.iter().any(|(d, _, e)| *d == desc_b && *e == RdpEvent::Connected));

        let a_events = a.take_events();
        let (desc_a, _, _) = a_events
            .iter()
            .find(|(_, _, e)| *e == RdpEvent::Accepted)
            .expect("listener side must accept");
        let desc_a = *desc_a;

        assert_eq!(a.state_of(desc_a), RdpState::Open);
        assert_eq!(b.state_of(desc_b), RdpState::Open);

        // B -> A: ten bytes, byte-exact
        let data: Vec<u8> = (0..10).collect();
        assert_eq!(b.send(desc_b, &data, now), 10);
        pump(&mut b, b_id, &mut a, a_id, now, false);

        let a_events = a.take_events();
        assert!(a_events.iter().any(|(d, _, e)| *d == desc_a && *e == RdpEvent::Ready2Read));
        assert_eq!(a.receive(desc_a), data);
    }

    #[test]
    fn lossy_transfer_is_byte_exact() {
        let (a_id, b_id) = ids();
        let mut a = Rdp::new();
        let mut b = Rdp::new();
        let mut now = Instant::now();

        a.listen(100).unwrap();
        let desc_b = b.connect(101, a_id, 100, now).unwrap();

        // the handshake itself survives loss through retransmission
        for _ in 0..200 {
            pump(&mut b, b_id, &mut a, a_id, now, true);
            now += TICK;
            a.tick(now);
            b.tick(now);
            if a.take_events().iter().any(|(_, _, e)| *e == RdpEvent::Accepted)
                || b.state_of(desc_b) == RdpState::Open
            {
                break;
            }
        }
        // settle remaining handshake traffic
        for _ in 0..20 {
            pump(&mut b, b_id, &mut a, a_id, now, true);
            now += TICK;
            a.tick(now);
            b.tick(now);
        }
        assert_eq!(b.state_of(desc_b), RdpState::Open);

        let desc_a = a
            .conns
            .iter()
            .find(|(_, c)| c.state == RdpState::Open)
            .map(|(d, _)| *d)
            .expect("accepted connection");

        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let sent = b.send(desc_b, &payload, now);
        assert_eq!(sent, payload.len());

        let mut received = Vec::new();
        for _ in 0..400 {
            pump(&mut b, b_id, &mut a, a_id, now, true);
            received.extend(a.receive(desc_a));
            if received.len() == payload.len() {
                break;
            }
            now += TICK;
            a.tick(now);
            b.tick(now);
        }

        assert_eq!(received, payload, "stream must be byte-exact despite loss");
    }

    #[test]
    fn refused_when_no_listener() {
        let (a_id, b_id) = ids();
        let mut a = Rdp::new();
        let mut b = Rdp::new();
        let now = Instant::now();

        let desc = b.connect(0, a_id, 700, now).unwrap();
        pump(&mut b, b_id, &mut a, a_id, now, false);

        let events = b.take_events();
        assert!(events.iter().any(|(d, _, e)| *d == desc && *e == RdpEvent::Refused));
        assert_eq!(b.state_of(desc), RdpState::Closed);
    }

    #[test]
    fn active_close_resets_peer() {
        let (a_id, b_id) = ids();
        let mut a = Rdp::new();
        let mut b = Rdp::new();
        let mut now = Instant::now();

        a.listen(100).unwrap();
        let desc_b = b.connect(101, a_id, 100, now).unwrap();
        pump(&mut b, b_id, &mut a, a_id, now, false);

        let desc_a = a
            .take_events()
            .iter()
            .find(|(_, _, e)| *e == RdpEvent::Accepted)
            .map(|(d, _, _)| *d)
            .unwrap();
        b.take_events();

        b.close(desc_b, now);
        assert_eq!(b.state_of(desc_b), RdpState::CloseWaitActive);
        pump(&mut b, b_id, &mut a, a_id, now, false);

        let a_events = a.take_events();
        assert!(a_events.iter().any(|(d, _, e)| *d == desc_a && *e == RdpEvent::Reset));
        assert_eq!(a.state_of(desc_a), RdpState::CloseWaitPasv);

        // B's retained RST ages past the ceiling; the closed descriptor
        // is deallocated
        now += Duration::from_secs(33);
        b.tick(now);
        assert_eq!(b.state_of(desc_b), RdpState::Closed);
    }

    #[test]
    fn syn_retry_ceiling_delivers_failed() {
        let (a_id, _b_id) = ids();
        let mut b = Rdp::new();
        let mut now = Instant::now();

        let desc = b.connect(0, a_id, 100, now).unwrap();
        b.take_output();

        let mut retransmissions = 0;
        let mut failed = false;
        for _ in 0..300 {
            now += TICK;
            b.tick(now);
            retransmissions += b.take_output().len();
            if b.take_events().iter().any(|(d, _, e)| *d == desc && *e == RdpEvent::Failed) {
                failed = true;
                break;
            }
        }

        assert!(failed, "SYN lost forever must deliver FAILED");
        assert!(retransmissions >= 4, "back-off must retransmit along the way");
        assert_eq!(b.state_of(desc), RdpState::Closed);
    }

    #[test]
    fn no_data_after_user_close() {
        let (a_id, b_id) = ids();
        let mut a = Rdp::new();
        let mut b = Rdp::new();
        let now = Instant::now();

        a.listen(100).unwrap();
        let desc_b = b.connect(101, a_id, 100, now).unwrap();
        pump(&mut b, b_id, &mut a, a_id, now, false);
        let desc_a = a
            .take_events()
            .iter()
            .find(|(_, _, e)| *e == RdpEvent::Accepted)
            .map(|(d, _, _)| *d)
            .unwrap();

        b.close(desc_b, now);
        assert_eq!(b.send(desc_b, b"late", now), 0, "closed connections take no data");

        pump(&mut b, b_id, &mut a, a_id, now, false);
        a.take_events();
        assert_eq!(a.send(desc_a, b"also late", now), 0);
    }
}
