//! ## Warren wire protocol
//!
//! Every overlay message travels in a single UDP datagram and starts with a
//! fixed 48-byte frame header carrying the protocol magic, a version, a
//! message type, the total length, and the 160-bit source and destination
//! identifiers. All multi-byte integers on the wire are big-endian.
//!
//! The message types cover five tightly coupled engines sharing the one
//! socket: NAT classification (echo probes), DTUN (a rendezvous Kademlia
//! whose value is "how to reach this identifier right now"), the DHT
//! (a storage Kademlia), best-effort datagrams with an optional relay
//! ("proxy") path for NATed peers, and RDP, a reliable connection-oriented
//! transport addressed by identifier rather than by IP.

pub mod id;
pub mod messages;
pub mod rdp;

use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::id::NodeId;

/// Frame magic, first two bytes of every datagram.
pub const MAGIC: u16 = 0xBABE;

/// Wire protocol version.
pub const VERSION: u8 = 0;

/// Size of the fixed frame header: magic, version, type, length and
/// reserved words plus the two identifiers.
pub const HEADER_LEN: usize = 8 + 2 * id::ID_LEN;

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    TooShort,
    BadMagic,
    BadVersion,
    LengthMismatch,
    UnknownType(u8),
    UnknownFamily(u16),
    InvalidInput,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Message type codes.
///
/// Grouped by engine; the dispatcher branches on this byte after the frame
/// header has been validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MsgType {
    NatEcho = 1,
    NatEchoReply = 2,
    NatEchoRedirect = 3,
    NatEchoRedirectReply = 4,
    DtunPing = 5,
    DtunPingReply = 6,
    DtunFindNode = 7,
    DtunFindNodeReply = 8,
    DtunFindValue = 9,
    DtunFindValueReply = 10,
    DtunRegister = 11,
    DtunRequest = 12,
    DtunRequestBy = 13,
    DtunRequestReply = 14,
    DhtPing = 15,
    DhtPingReply = 16,
    DhtFindNode = 17,
    DhtFindNodeReply = 18,
    DhtFindValue = 19,
    DhtFindValueReply = 20,
    DhtStore = 21,
    Dgram = 22,
    Advertise = 23,
    AdvertiseReply = 24,
    ProxyRegister = 25,
    ProxyStore = 26,
    ProxyGet = 27,
    ProxyGetReply = 28,
    ProxyDgram = 29,
    ProxyRdp = 30,
    Rdp = 31,
}

/// Address family codes used inside message bodies.
///
/// `Loopback` is a sentinel: a node referring to itself in a node list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum Family {
    Loopback = 0,
    Inet = 1,
    Inet6 = 2,
}

/// Reachability state advertised in find-node queries.
pub const STATE_GLOBAL: u16 = 1;
pub const STATE_NAT: u16 = 2;

/// The fixed frame header.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
/// use warren_codec::{Header, MsgType};
/// use warren_codec::id::NodeId;
///
/// let src = NodeId::from_bit(0);
/// let dst = NodeId::from_bit(159);
///
/// let mut buf = BytesMut::new();
/// Header::begin(MsgType::DtunPing, &src, &dst, &mut buf);
/// buf.extend_from_slice(&7u32.to_be_bytes());
/// Header::finish(&mut buf);
///
/// assert_eq!(buf.len(), warren_codec::HEADER_LEN + 4);
/// assert_eq!(&buf[..2], &[0xba, 0xbe]);
///
/// let (hdr, body) = Header::decode(&buf).unwrap();
/// assert_eq!(hdr.kind, MsgType::DtunPing);
/// assert_eq!(hdr.src, src);
/// assert_eq!(hdr.dst, dst);
/// assert_eq!(body, &7u32.to_be_bytes());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub kind: MsgType,
    pub src: NodeId,
    pub dst: NodeId,
}

impl Header {
    /// Write a frame header with a zero length placeholder.
    ///
    /// The body is appended by the caller; `finish` patches the length.
    pub fn begin(kind: MsgType, src: &NodeId, dst: &NodeId, bytes: &mut BytesMut) {
        bytes.put_u16(MAGIC);
        bytes.put_u8(VERSION);
        bytes.put_u8(kind.into());
        bytes.put_u16(0);
        bytes.put_u16(0);
        bytes.put_slice(src.as_bytes());
        bytes.put_slice(dst.as_bytes());
    }

    /// Patch the total length into a frame started with `begin`.
    pub fn finish(bytes: &mut BytesMut) {
        let len = (bytes.len() as u16).to_be_bytes();
        bytes[4] = len[0];
        bytes[5] = len[1];
    }

    /// Validate a datagram and split it into header and body.
    ///
    /// Rejects short datagrams, wrong magic, wrong version, a length field
    /// that disagrees with the datagram size, and unknown type codes.
    pub fn decode(bytes: &[u8]) -> Result<(Header, &[u8]), Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::TooShort);
        }

        if u16::from_be_bytes([bytes[0], bytes[1]]) != MAGIC {
            return Err(Error::BadMagic);
        }

        if bytes[2] != VERSION {
            return Err(Error::BadVersion);
        }

        let kind = MsgType::try_from(bytes[3]).map_err(|_| Error::UnknownType(bytes[3]))?;

        if u16::from_be_bytes([bytes[4], bytes[5]]) as usize != bytes.len() {
            return Err(Error::LengthMismatch);
        }

        let src = NodeId::from_slice(&bytes[8..28]);
        let dst = NodeId::from_slice(&bytes[28..48]);

        Ok((Header { kind, src, dst }, &bytes[HEADER_LEN..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(kind: MsgType) -> BytesMut {
        let mut buf = BytesMut::new();
        Header::begin(kind, &NodeId::from_bit(3), &NodeId::from_bit(4), &mut buf);
        Header::finish(&mut buf);
        buf
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = frame(MsgType::DhtPing);
        buf[0] = 0;
        assert_eq!(Header::decode(&buf).unwrap_err(), Error::BadMagic);
    }

    #[test]
    fn rejects_bad_version() {
        let mut buf = frame(MsgType::DhtPing);
        buf[2] = 9;
        assert_eq!(Header::decode(&buf).unwrap_err(), Error::BadVersion);
    }

    #[test]
    fn rejects_truncated_frame() {
        let buf = frame(MsgType::DhtPing);
        assert_eq!(Header::decode(&buf[..20]).unwrap_err(), Error::TooShort);
    }

    #[test]
    fn body_starts_right_after_both_identifiers() {
        let mut buf = frame(MsgType::DhtPing);
        buf.put_u32(0xdead_beef);
        Header::finish(&mut buf);

        let (_, body) = Header::decode(&buf).unwrap();
        assert_eq!(body, &0xdead_beef_u32.to_be_bytes());
        assert_eq!(buf.len() - body.len(), HEADER_LEN);
        assert_eq!(HEADER_LEN, 48);
    }

    #[test]
    fn crafted_sub_header_datagram_is_rejected_not_a_panic() {
        // shorter than the two identifiers but with plausible magic,
        // version and a self-consistent length field
        let mut buf = BytesMut::new();
        buf.put_u16(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(MsgType::DhtPing.into());
        buf.put_u16(44);
        buf.put_u16(0);
        buf.put_slice(&[0u8; 36]);

        assert_eq!(buf.len(), 44);
        assert_eq!(Header::decode(&buf).unwrap_err(), Error::TooShort);
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut buf = frame(MsgType::DhtPing);
        buf.put_u8(0);
        assert_eq!(Header::decode(&buf).unwrap_err(), Error::LengthMismatch);
    }

    #[test]
    fn rejects_unknown_type() {
        let mut buf = frame(MsgType::DhtPing);
        buf[3] = 200;
        assert_eq!(Header::decode(&buf).unwrap_err(), Error::UnknownType(200));
    }
}
