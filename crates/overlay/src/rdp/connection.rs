//! Per-connection state: sequence variables, the sliding send and receive
//! windows, and the retained handshake/close packets.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use codec::rdp::{put_ack, put_data, put_syn, SynPayload, FLAG_ACK, MAX_EAK, SYN_OPT_SEQUENCED};

use super::{RdpAddr, RdpState};

/// Default receive window, in segments.
pub const RCV_MAX_DEFAULT: u32 = 1024;

/// Default largest acceptable segment, in octets.
pub const RBUF_MAX_DEFAULT: u32 = 1500;

/// Payload slice size for `send`.
pub const MAX_SEG_DATA: usize = 1024;

/// Initial retransmission timeout; doubles per retry.
pub const RT_INITIAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct SendSlot {
    payload: Bytes,
    seqnum: u32,
    /// First transmission; anchors the broken-pipe ceiling.
    first_sent: Instant,
    /// Last (re)transmission; anchors the back-off.
    sent_time: Instant,
    rt_tout: Duration,
    is_sent: bool,
    is_acked: bool,
}

#[derive(Debug)]
struct RecvSlot {
    payload: Bytes,
    seqnum: u32,
    is_used: bool,
    is_eacked: bool,
}

/// A retained handshake packet, retransmitted with back-off until
/// acknowledged or the ceiling is hit.
#[derive(Debug, Clone, Copy)]
pub(super) struct RetainedSyn {
    pub flags: u8,
    pub started: Instant,
    pub time: Instant,
    pub tout: Duration,
}

/// A retained RST (or RST+FIN) driving the close handshake.
#[derive(Debug, Clone, Copy)]
pub(super) struct RetainedRst {
    pub flags: u8,
    pub seqnum: u32,
    pub started: Instant,
    pub time: Instant,
    pub tout: Duration,
    pub retry: bool,
}

#[derive(Debug)]
pub struct Connection {
    pub addr: RdpAddr,
    pub desc: i32,
    pub is_pasv: bool,
    pub is_closed: bool,
    pub state: RdpState,

    /// Largest segment the peer accepts, from its SYN.
    pub sbuf_max: u32,
    /// Largest segment we accept, sent in our SYN.
    pub rbuf_max: u32,

    pub snd_iss: u32,
    pub snd_nxt: u32,
    pub snd_una: u32,
    /// Max outstanding segments, from the peer's SYN.
    pub snd_max: u32,

    pub rcv_cur: u32,
    pub rcv_max: u32,
    pub rcv_irs: u32,
    pub rcv_ack: u32,
    pub acked_time: Instant,

    pub(super) syn: Option<RetainedSyn>,
    pub(super) rst: Option<RetainedRst>,

    swnd: Vec<SendSlot>,
    swnd_head: usize,
    swnd_used: usize,
    /// Index of the first enqueued-but-unsent slot.
    swnd_ostand: usize,

    rwnd: Vec<RecvSlot>,
    rwnd_head: usize,
    rwnd_used: usize,

    /// In-order data ready for the application.
    pub rqueue: VecDeque<Bytes>,
}

impl Connection {
    pub(super) fn new(addr: RdpAddr, desc: i32, is_pasv: bool, now: Instant) -> Self {
        Self {
            addr,
            desc,
            is_pasv,
            is_closed: false,
            state: RdpState::Closed,
            sbuf_max: 0,
            rbuf_max: RBUF_MAX_DEFAULT,
            snd_iss: 0,
            snd_nxt: 0,
            snd_una: 0,
            snd_max: 0,
            rcv_cur: 0,
            rcv_max: RCV_MAX_DEFAULT,
            rcv_irs: 0,
            rcv_ack: 0,
            acked_time: now,
            syn: None,
            rst: None,
            swnd: Vec::new(),
            swnd_head: 0,
            swnd_used: 0,
            swnd_ostand: 0,
            rwnd: Vec::new(),
            rwnd_head: 0,
            rwnd_used: 0,
            rqueue: VecDeque::new(),
        }
    }

    /// Size both windows once the SYN exchange fixed the parameters.
    pub(super) fn init_windows(&mut self, now: Instant) {
        let swnd_len = (self.snd_max as usize).max(1) * 4;
        self.swnd.clear();
        self.swnd.reserve(swnd_len);
        for _ in 0..swnd_len {
            self.swnd.push(SendSlot {
                payload: Bytes::new(),
                seqnum: 0,
                first_sent: now,
                sent_time: now,
                rt_tout: RT_INITIAL,
                is_sent: false,
                is_acked: false,
            });
        }
        self.swnd_head = 0;
        self.swnd_used = 0;
        self.swnd_ostand = 0;

        let rwnd_len = (self.rcv_max as usize).max(1) * 2;
        self.rwnd.clear();
        self.rwnd.reserve(rwnd_len);
        for _ in 0..rwnd_len {
            self.rwnd.push(RecvSlot {
                payload: Bytes::new(),
                seqnum: 0,
                is_used: false,
                is_eacked: false,
            });
        }
        self.rwnd_head = 0;
        self.rwnd_used = 0;
    }

    /// The SYN negotiation payload we advertise.
    pub(super) fn syn_payload(&self) -> SynPayload {
        SynPayload {
            out_segs_max: self.rcv_max as u16,
            seg_size_max: self.rbuf_max as u16,
            options: SYN_OPT_SEQUENCED,
        }
    }

    /// Encode the retained SYN (or SYN+ACK) for (re)transmission.
    pub(super) fn encode_syn(&self, flags: u8) -> Bytes {
        let mut buf = BytesMut::new();
        let acknum = if flags & FLAG_ACK != 0 { self.rcv_cur } else { 0 };
        put_syn(
            &mut buf,
            flags,
            self.addr.sport,
            self.addr.dport,
            self.snd_iss,
            acknum,
            self.syn_payload(),
        );
        buf.freeze()
    }

    /// Enqueue one segment payload. Fails when the window array is full
    /// or the connection is not open.
    pub(super) fn enqueue_swnd(&mut self, payload: Bytes, now: Instant) -> bool {
        if self.swnd_used >= self.swnd.len() || self.state != RdpState::Open {
            return false;
        }

        let pos = (self.swnd_head + self.swnd_used) % self.swnd.len();
        let slot = &mut self.swnd[pos];
        slot.payload = payload;
        slot.seqnum = 0;
        slot.first_sent = now;
        slot.sent_time = now;
        slot.rt_tout = RT_INITIAL;
        slot.is_sent = false;
        slot.is_acked = false;

        self.swnd_used += 1;
        true
    }

    /// Transmit enqueued segments while fewer than `snd_max` are
    /// outstanding. Stamps sequence numbers at transmission time.
    pub(super) fn send_outstanding(&mut self, now: Instant, out: &mut Vec<Bytes>) {
        let len = self.swnd.len();
        if len == 0 {
            return;
        }

        let mut i = self.swnd_ostand;
        let end = (self.swnd_head + self.swnd_used) % len;

        while i != end {
            if self.snd_nxt.wrapping_sub(self.snd_una) >= self.snd_max {
                break;
            }

            let seqnum = self.snd_nxt;
            let slot = &mut self.swnd[i];
            slot.first_sent = now;
            slot.sent_time = now;
            slot.is_sent = true;
            slot.seqnum = seqnum;

            let mut buf = BytesMut::new();
            put_data(
                &mut buf,
                self.addr.sport,
                self.addr.dport,
                seqnum,
                self.rcv_cur,
                &slot.payload,
            );
            out.push(buf.freeze());

            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            i = (i + 1) % len;
        }

        self.swnd_ostand = i;
    }

    /// Walk unacked segments; retransmit overdue ones with doubled
    /// back-off. Returns `false` when a segment aged past `max_retrans`
    /// (the connection is broken).
    pub(super) fn retransmit(&mut self, now: Instant, max_retrans: Duration, out: &mut Vec<Bytes>) -> bool {
        if self.swnd_used == 0 {
            return true;
        }

        let len = self.swnd.len();
        let mut i = self.swnd_head;
        let mut seen = 0;

        while seen < self.swnd_used {
            if !self.swnd[i].is_sent {
                break;
            }

            if !self.swnd[i].is_acked {
                if now.duration_since(self.swnd[i].first_sent) > max_retrans {
                    return false;
                }

                let age = now.duration_since(self.swnd[i].sent_time);
                if age > self.swnd[i].rt_tout {
                    let slot = &mut self.swnd[i];
                    slot.sent_time = now;
                    slot.rt_tout *= 2;

                    let mut buf = BytesMut::new();
                    put_data(
                        &mut buf,
                        self.addr.sport,
                        self.addr.dport,
                        slot.seqnum,
                        self.rcv_cur,
                        &slot.payload,
                    );
                    out.push(buf.freeze());
                }
            }

            seen += 1;
            i = (i + 1) % len;
        }

        true
    }

    /// Cumulative acknowledgement.
    ///
    /// Accepted iff `ack` lies in the half-sequence-space
    /// `[snd_una, snd_nxt)`; a wrapped comparison handles sequence
    /// wrap-around without accepting multi-wrap jumps.
    pub(super) fn recv_ack(&mut self, acknum: u32) {
        if acknum.wrapping_sub(self.snd_una) < self.snd_nxt.wrapping_sub(self.snd_una) {
            let len = self.swnd.len();
            let mut i = self.swnd_head;

            while i != self.swnd_ostand {
                let covered = self.swnd[i].seqnum.wrapping_sub(self.snd_una)
                    <= acknum.wrapping_sub(self.snd_una);
                if !covered {
                    break;
                }

                let slot = &mut self.swnd[i];
                if slot.is_sent {
                    slot.payload = Bytes::new();
                    slot.is_acked = false;
                    self.swnd_used -= 1;
                }

                i = (i + 1) % len;
            }

            self.swnd_head = i;
            self.snd_una = acknum;
        }
    }

    /// Extended acknowledgement of a single out-of-order segment.
    pub(super) fn recv_eack(&mut self, eacknum: u32) {
        if self.swnd_used == 0 {
            return;
        }

        let len = self.swnd.len();
        let head_seq = self.swnd[self.swnd_head].seqnum;
        let pos = eacknum.wrapping_sub(head_seq);
        if pos >= len as u32 {
            return;
        }

        let idx = (self.swnd_head + pos as usize) % len;
        {
            let slot = &mut self.swnd[idx];
            if slot.seqnum == eacknum && slot.is_sent && !slot.is_acked {
                slot.payload = Bytes::new();
                slot.is_acked = true;
            }
        }

        // slide the head over segments already acked out of order; the
        // cumulative position only moves on a plain ACK
        while self.swnd_head != self.swnd_ostand
            && self.swnd[self.swnd_head].is_sent
            && self.swnd[self.swnd_head].is_acked
        {
            self.swnd[self.swnd_head].is_acked = false;
            self.swnd_head = (self.swnd_head + 1) % len;
            self.swnd_used -= 1;
        }
    }

    /// Place an in-window segment into the receive buffer and advance
    /// `rcv_cur` over every contiguous segment. Returns
    /// `(read_queue_grew_from_empty, ack_now)`.
    pub(super) fn rwnd_recv_data(&mut self, payload: Bytes, seqnum: u32) -> (bool, bool) {
        let len = self.rwnd.len();
        if len == 0 {
            return (false, false);
        }

        let was_empty = self.rqueue.is_empty();
        let is_nul = payload.is_empty();

        let seq_off = seqnum.wrapping_sub(self.rcv_cur);
        if !(0 < seq_off && seq_off <= len as u32) {
            return (false, false);
        }

        let idx = (self.rwnd_head + seq_off as usize - 1) % len;
        if !self.rwnd[idx].is_used {
            let slot = &mut self.rwnd[idx];
            slot.payload = payload;
            slot.seqnum = seqnum;
            slot.is_used = true;
            slot.is_eacked = false;
            self.rwnd_used += 1;
        }

        while self.rwnd[self.rwnd_head].is_used {
            self.rcv_cur = self.rcv_cur.wrapping_add(1);

            let slot = &mut self.rwnd[self.rwnd_head];
            if !slot.payload.is_empty() {
                self.rqueue.push_back(std::mem::take(&mut slot.payload));
            } else {
                slot.payload = Bytes::new();
            }
            slot.is_used = false;
            slot.is_eacked = false;

            self.rwnd_used -= 1;
            self.rwnd_head = (self.rwnd_head + 1) % len;
        }

        let grew = was_empty && !self.rqueue.is_empty();
        let ack_now =
            self.rcv_cur.wrapping_sub(self.rcv_ack) > self.rcv_max / 4 || is_nul;
        (grew, ack_now)
    }

    /// Emit an acknowledgement when something needs acking: a moved
    /// `rcv_cur`, or out-of-order segments not yet covered by an EAK.
    pub(super) fn delayed_ack(&mut self, now: Instant, out: &mut Vec<Bytes>) {
        let len = self.rwnd.len();
        let mut eaks: Vec<u32> = Vec::new();

        if len > 0 {
            let mut idx = self.rwnd_head;
            let mut seen = 0;
            while seen < self.rwnd_used && eaks.len() < MAX_EAK {
                if self.rwnd[idx].is_used {
                    if !self.rwnd[idx].is_eacked {
                        self.rwnd[idx].is_eacked = true;
                        eaks.push(self.rwnd[idx].seqnum);
                    }
                    seen += 1;
                }
                idx = (idx + 1) % len;
            }
        }

        if self.rcv_cur == self.rcv_ack && eaks.is_empty() {
            return;
        }

        let mut buf = BytesMut::new();
        put_ack(
            &mut buf,
            self.addr.sport,
            self.addr.dport,
            self.snd_nxt,
            self.rcv_cur,
            &eaks,
        );
        out.push(buf.freeze());

        self.rcv_ack = self.rcv_cur;
        self.acked_time = now;
    }

    /// A plain ACK of the current receive cursor.
    pub(super) fn plain_ack(&mut self, now: Instant, out: &mut Vec<Bytes>) {
        let mut buf = BytesMut::new();
        put_ack(
            &mut buf,
            self.addr.sport,
            self.addr.dport,
            self.snd_nxt,
            self.rcv_cur,
            &[],
        );
        out.push(buf.freeze());

        self.rcv_ack = self.rcv_cur;
        self.acked_time = now;
    }

    #[cfg(test)]
    pub(super) fn swnd_used(&self) -> usize {
        self.swnd_used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::id::NodeId;

    fn open_conn(now: Instant) -> Connection {
        let mut con = Connection::new(
            RdpAddr {
                did: NodeId::from_bit(1),
                dport: 200,
                sport: 100,
            },
            7,
            false,
            now,
        );
        con.state = RdpState::Open;
        con.snd_iss = 1000;
        con.snd_nxt = 1001;
        con.snd_una = 1001;
        con.snd_max = 4;
        con.rcv_cur = 5000;
        con.rcv_ack = 5000;
        con.rcv_irs = 5000;
        con.rcv_max = 8;
        con.init_windows(now);
        con
    }

    #[test]
    fn window_caps_outstanding_segments() {
        let now = Instant::now();
        let mut con = open_conn(now);
        let mut out = Vec::new();

        for i in 0..6u8 {
            assert!(con.enqueue_swnd(Bytes::copy_from_slice(&[i]), now));
        }
        con.send_outstanding(now, &mut out);

        // snd_max = 4: only four transmitted, two queued unsent
        assert_eq!(out.len(), 4);
        assert_eq!(con.snd_nxt, 1005);

        // cumulative ack for two frees window space
        con.recv_ack(1003);
        con.send_outstanding(now, &mut out);
        assert_eq!(out.len(), 6);
        assert_eq!(con.snd_nxt, 1007);
    }

    #[test]
    fn ack_outside_half_space_is_rejected() {
        let now = Instant::now();
        let mut con = open_conn(now);
        let mut out = Vec::new();

        con.enqueue_swnd(Bytes::from_static(b"x"), now);
        con.send_outstanding(now, &mut out);

        let una = con.snd_una;
        con.recv_ack(una.wrapping_sub(10));
        assert_eq!(con.snd_una, una, "stale ack must not move the window");

        con.recv_ack(una.wrapping_add(100));
        assert_eq!(con.snd_una, una, "ack beyond snd_nxt must be rejected");
    }

    #[test]
    fn eack_marks_without_moving_una_past_holes() {
        let now = Instant::now();
        let mut con = open_conn(now);
        let mut out = Vec::new();

        for i in 0..3u8 {
            con.enqueue_swnd(Bytes::copy_from_slice(&[i]), now);
        }
        con.send_outstanding(now, &mut out);
        assert_eq!(con.swnd_used(), 3);

        // peer got 1002 out of order; 1001 still missing
        con.recv_eack(1002);
        assert_eq!(con.snd_una, 1001, "eack must not move the cumulative position");
        assert_eq!(con.swnd_used(), 3);

        // the hole fills out of order too: head slides over both
        con.recv_eack(1001);
        assert_eq!(con.snd_una, 1001);
        assert_eq!(con.swnd_used(), 1);

        // the cumulative ack finally covers everything
        con.recv_ack(1003);
        assert_eq!(con.snd_una, 1003);
        assert_eq!(con.swnd_used(), 0);
    }

    #[test]
    fn receive_window_reorders() {
        let now = Instant::now();
        let mut con = open_conn(now);

        let (grew, _) = con.rwnd_recv_data(Bytes::from_static(b"b"), 5002);
        assert!(!grew, "gap: nothing readable yet");
        assert_eq!(con.rcv_cur, 5000);

        let (grew, _) = con.rwnd_recv_data(Bytes::from_static(b"a"), 5001);
        assert!(grew);
        assert_eq!(con.rcv_cur, 5002);
        assert_eq!(con.rqueue.len(), 2);
        assert_eq!(&con.rqueue[0][..], b"a");
        assert_eq!(&con.rqueue[1][..], b"b");
    }

    #[test]
    fn stale_and_far_future_segments_are_ignored() {
        let now = Instant::now();
        let mut con = open_conn(now);

        // seq <= rcv_cur
        let (grew, _) = con.rwnd_recv_data(Bytes::from_static(b"x"), 5000);
        assert!(!grew);
        assert_eq!(con.rwnd_used, 0);

        // beyond 2 * rcv_max
        let (grew, _) = con.rwnd_recv_data(Bytes::from_static(b"y"), 5000 + 17);
        assert!(!grew);
        assert_eq!(con.rwnd_used, 0);
    }

    #[test]
    fn duplicate_segment_is_not_delivered_twice() {
        let now = Instant::now();
        let mut con = open_conn(now);

        con.rwnd_recv_data(Bytes::from_static(b"a"), 5001);
        assert_eq!(con.rqueue.len(), 1);

        // duplicate of an already-consumed sequence number
        let (grew, _) = con.rwnd_recv_data(Bytes::from_static(b"a"), 5001);
        assert!(!grew);
        assert_eq!(con.rqueue.len(), 1);
    }

    #[test]
    fn delayed_ack_carries_eaks_once() {
        let now = Instant::now();
        let mut con = open_conn(now);
        let mut out = Vec::new();

        con.rwnd_recv_data(Bytes::from_static(b"b"), 5003);
        con.rwnd_recv_data(Bytes::from_static(b"c"), 5005);

        con.delayed_ack(now, &mut out);
        assert_eq!(out.len(), 1);
        let seg = codec::rdp::Segment::decode(&out[0]).unwrap();
        assert_eq!(seg.eaks, vec![5003, 5005]);

        // nothing new: no second ack
        con.delayed_ack(now, &mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn retransmission_backs_off_and_breaks() {
        let now = Instant::now();
        let mut con = open_conn(now);
        let mut out = Vec::new();

        con.enqueue_swnd(Bytes::from_static(b"x"), now);
        con.send_outstanding(now, &mut out);
        out.clear();

        // within rt_tout: silent
        assert!(con.retransmit(now + Duration::from_millis(500), Duration::from_secs(32), &mut out));
        assert!(out.is_empty());

        // past rt_tout: exactly one retransmission, back-off doubles
        assert!(con.retransmit(now + Duration::from_secs(2), Duration::from_secs(32), &mut out));
        assert_eq!(out.len(), 1);

        // past the ceiling: broken
        assert!(!con.retransmit(now + Duration::from_secs(40), Duration::from_secs(32), &mut out));
    }
}
