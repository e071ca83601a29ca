//! RDP segment codec.
//!
//! RDP segments ride inside frames of type `rdp` (or `proxy-rdp` when
//! relayed). The segment header is 22 bytes; SYN segments append their
//! negotiation payload and EAK segments append a list of out-of-order
//! sequence numbers, both covered by `hlen` (expressed in 2-byte words).
//!
//! ```text
//! flags(u8) | hlen(u8) | sport(u16) | dport(u16) | dlen(u16)
//! seqnum(u32) | acknum(u32) | reserved(u32)
//! ```

use bytes::{BufMut, BytesMut};

use crate::Error;

pub const FLAG_SYN: u8 = 0x80;
pub const FLAG_ACK: u8 = 0x40;
pub const FLAG_EAK: u8 = 0x20;
pub const FLAG_RST: u8 = 0x10;
pub const FLAG_NUL: u8 = 0x08;
pub const FLAG_FIN: u8 = 0x04;

/// Version nibble carried in the low bits of `flags`.
pub const FLAG_VER: u8 = 2;

/// Segment header size in bytes.
pub const SEGMENT_HEADER_LEN: usize = 22;

/// SYN negotiation payload size in bytes.
pub const SYN_PAYLOAD_LEN: usize = 6;

/// SYN option: sequenced delivery.
pub const SYN_OPT_SEQUENCED: u16 = 0x0001;

/// Most out-of-order sequence numbers a single EAK can carry.
pub const MAX_EAK: usize = 64;

/// A decoded segment. `payload` borrows the data portion of the input.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
/// use warren_codec::rdp::*;
///
/// let mut buf = BytesMut::new();
/// put_data(&mut buf, 101, 100, 9, 4, b"hello");
///
/// let seg = Segment::decode(&buf).unwrap();
/// assert_eq!(seg.flags & FLAG_ACK, FLAG_ACK);
/// assert_eq!(seg.sport, 101);
/// assert_eq!(seg.dport, 100);
/// assert_eq!(seg.seqnum, 9);
/// assert_eq!(seg.acknum, 4);
/// assert_eq!(seg.payload, b"hello");
/// ```
#[derive(Debug, PartialEq, Eq)]
pub struct Segment<'a> {
    pub flags: u8,
    pub sport: u16,
    pub dport: u16,
    pub dlen: u16,
    pub seqnum: u32,
    pub acknum: u32,
    /// SYN negotiation values, present when `flags` carries `SYN`.
    pub syn: Option<SynPayload>,
    /// Out-of-order sequence numbers, non-empty when `flags` carries `EAK`.
    pub eaks: Vec<u32>,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynPayload {
    pub out_segs_max: u16,
    pub seg_size_max: u16,
    pub options: u16,
}

impl<'a> Segment<'a> {
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < SEGMENT_HEADER_LEN {
            return Err(Error::TooShort);
        }

        let flags = bytes[0];
        let hlen = bytes[1] as usize * 2;
        if hlen < SEGMENT_HEADER_LEN || hlen > bytes.len() {
            return Err(Error::LengthMismatch);
        }

        let dlen = u16::from_be_bytes([bytes[6], bytes[7]]);
        if hlen + dlen as usize != bytes.len() {
            return Err(Error::LengthMismatch);
        }

        let mut syn = None;
        let mut eaks = Vec::new();

        if flags & FLAG_SYN != 0 {
            if hlen < SEGMENT_HEADER_LEN + SYN_PAYLOAD_LEN {
                return Err(Error::TooShort);
            }
            syn = Some(SynPayload {
                out_segs_max: u16::from_be_bytes([bytes[22], bytes[23]]),
                seg_size_max: u16::from_be_bytes([bytes[24], bytes[25]]),
                options: u16::from_be_bytes([bytes[26], bytes[27]]),
            });
        } else if flags & FLAG_EAK != 0 {
            let count = (hlen - SEGMENT_HEADER_LEN) / 4;
            eaks.reserve(count);
            for i in 0..count {
                let off = SEGMENT_HEADER_LEN + i * 4;
                eaks.push(u32::from_be_bytes([
                    bytes[off],
                    bytes[off + 1],
                    bytes[off + 2],
                    bytes[off + 3],
                ]));
            }
        }

        Ok(Self {
            flags,
            sport: u16::from_be_bytes([bytes[2], bytes[3]]),
            dport: u16::from_be_bytes([bytes[4], bytes[5]]),
            dlen,
            seqnum: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            acknum: u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
            syn,
            eaks,
            payload: &bytes[hlen..],
        })
    }
}

fn put_header(
    buf: &mut BytesMut,
    flags: u8,
    hlen: usize,
    sport: u16,
    dport: u16,
    dlen: u16,
    seqnum: u32,
    acknum: u32,
) {
    buf.put_u8(flags | FLAG_VER);
    buf.put_u8((hlen / 2) as u8);
    buf.put_u16(sport);
    buf.put_u16(dport);
    buf.put_u16(dlen);
    buf.put_u32(seqnum);
    buf.put_u32(acknum);
    buf.put_u32(0);
}

/// A data segment: `ACK` plus payload.
pub fn put_data(buf: &mut BytesMut, sport: u16, dport: u16, seqnum: u32, acknum: u32, data: &[u8]) {
    put_header(
        buf,
        FLAG_ACK,
        SEGMENT_HEADER_LEN,
        sport,
        dport,
        data.len() as u16,
        seqnum,
        acknum,
    );
    buf.put_slice(data);
}

/// A plain or extended acknowledgement. `eaks` may be empty.
pub fn put_ack(buf: &mut BytesMut, sport: u16, dport: u16, seqnum: u32, acknum: u32, eaks: &[u32]) {
    let flags = if eaks.is_empty() {
        FLAG_ACK
    } else {
        FLAG_ACK | FLAG_EAK
    };

    put_header(
        buf,
        flags,
        SEGMENT_HEADER_LEN + eaks.len() * 4,
        sport,
        dport,
        0,
        seqnum,
        acknum,
    );
    for eak in eaks {
        buf.put_u32(*eak);
    }
}

/// A SYN or SYN+ACK segment with its negotiation payload.
pub fn put_syn(
    buf: &mut BytesMut,
    flags: u8,
    sport: u16,
    dport: u16,
    seqnum: u32,
    acknum: u32,
    syn: SynPayload,
) {
    put_header(
        buf,
        flags,
        SEGMENT_HEADER_LEN + SYN_PAYLOAD_LEN,
        sport,
        dport,
        0,
        seqnum,
        acknum,
    );
    buf.put_u16(syn.out_segs_max);
    buf.put_u16(syn.seg_size_max);
    buf.put_u16(syn.options);
}

/// A bare control segment (RST, RST+FIN, RST+ACK, FIN, NUL).
pub fn put_control(
    buf: &mut BytesMut,
    flags: u8,
    sport: u16,
    dport: u16,
    seqnum: u32,
    acknum: u32,
) {
    put_header(buf, flags, SEGMENT_HEADER_LEN, sport, dport, 0, seqnum, acknum);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syn_round_trip() {
        let mut buf = BytesMut::new();
        put_syn(
            &mut buf,
            FLAG_SYN | FLAG_ACK,
            2000,
            100,
            1_000_000,
            77,
            SynPayload {
                out_segs_max: 1024,
                seg_size_max: 1500,
                options: SYN_OPT_SEQUENCED,
            },
        );

        let seg = Segment::decode(&buf).unwrap();
        assert_eq!(seg.flags & FLAG_SYN, FLAG_SYN);
        assert_eq!(seg.flags & FLAG_ACK, FLAG_ACK);
        assert_eq!(seg.flags & 0x03, FLAG_VER & 0x03);
        assert_eq!(
            seg.syn,
            Some(SynPayload {
                out_segs_max: 1024,
                seg_size_max: 1500,
                options: SYN_OPT_SEQUENCED,
            })
        );
        assert_eq!(seg.payload.len(), 0);
    }

    #[test]
    fn eak_list_is_covered_by_hlen() {
        let mut buf = BytesMut::new();
        put_ack(&mut buf, 1, 2, 10, 20, &[21, 23, 27]);

        assert_eq!(buf.len(), SEGMENT_HEADER_LEN + 12);
        assert_eq!(buf[1] as usize * 2, buf.len());

        let seg = Segment::decode(&buf).unwrap();
        assert_eq!(seg.eaks, vec![21, 23, 27]);
        assert_eq!(seg.acknum, 20);
    }

    #[test]
    fn truncated_segment_is_rejected() {
        let mut buf = BytesMut::new();
        put_data(&mut buf, 1, 2, 3, 4, b"abcdef");

        assert_eq!(Segment::decode(&buf[..10]).unwrap_err(), Error::TooShort);
        assert_eq!(
            Segment::decode(&buf[..buf.len() - 1]).unwrap_err(),
            Error::LengthMismatch
        );
    }
}
