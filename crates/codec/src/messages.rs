//! Message body codecs.
//!
//! Each body is everything after the 48-byte frame header. Encoders write a
//! complete datagram (frame header included); decoders take the body slice
//! returned by [`Header::decode`](crate::Header::decode).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};

use crate::id::{ID_LEN, NodeId};
use crate::{Error, Family, Header, MsgType};

/// Size of an embedded endpoint: family, port and a 16-byte address field
/// (IPv4 occupies the first four bytes).
const ENDPOINT_LEN: usize = 20;

fn put_endpoint(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u16(Family::Inet.into());
            buf.put_u16(addr.port());
            buf.put_slice(&ip.octets());
            buf.put_slice(&[0u8; 12]);
        }
        IpAddr::V6(ip) => {
            buf.put_u16(Family::Inet6.into());
            buf.put_u16(addr.port());
            buf.put_slice(&ip.octets());
        }
    }
}

fn get_endpoint(b: &[u8]) -> Result<SocketAddr, Error> {
    if b.len() < ENDPOINT_LEN {
        return Err(Error::TooShort);
    }

    let family = u16::from_be_bytes([b[0], b[1]]);
    let port = u16::from_be_bytes([b[2], b[3]]);

    match Family::try_from(family).map_err(|_| Error::UnknownFamily(family))? {
        Family::Inet => {
            let ip = Ipv4Addr::new(b[4], b[5], b[6], b[7]);
            Ok(SocketAddr::new(IpAddr::V4(ip), port))
        }
        Family::Inet6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&b[4..20]);
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        Family::Loopback => Err(Error::UnknownFamily(family)),
    }
}

/// A body that is nothing but a 32-bit nonce.
///
/// Used by ping and ping-reply in both Kademlia realms, request-reply and
/// advertise-reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlainNonce {
    pub nonce: u32,
}

impl PlainNonce {
    pub fn encode(&self, kind: MsgType, src: &NodeId, dst: &NodeId, buf: &mut BytesMut) {
        Header::begin(kind, src, dst, buf);
        buf.put_u32(self.nonce);
        Header::finish(buf);
    }

    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        if body.len() < 4 {
            return Err(Error::TooShort);
        }
        Ok(Self {
            nonce: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
        })
    }
}

/// NAT echo probe.
pub type Echo = PlainNonce;

/// NAT echo reply and echo-redirect reply: the nonce plus the endpoint the
/// responder observed the probe from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReply {
    pub nonce: u32,
    pub observed: SocketAddr,
}

impl EchoReply {
    pub fn encode(&self, kind: MsgType, src: &NodeId, dst: &NodeId, buf: &mut BytesMut) {
        Header::begin(kind, src, dst, buf);
        buf.put_u32(self.nonce);
        put_endpoint(buf, &self.observed);
        Header::finish(buf);
    }

    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        if body.len() < 4 + ENDPOINT_LEN {
            return Err(Error::TooShort);
        }
        Ok(Self {
            nonce: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            observed: get_endpoint(&body[4..])?,
        })
    }
}

/// NAT echo-redirect: asks the peer to answer on `port` instead of the
/// port the probe came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoRedirect {
    pub nonce: u32,
    pub port: u16,
}

impl EchoRedirect {
    pub fn encode(&self, src: &NodeId, dst: &NodeId, buf: &mut BytesMut) {
        Header::begin(MsgType::NatEchoRedirect, src, dst, buf);
        buf.put_u32(self.nonce);
        buf.put_u16(self.port);
        buf.put_u16(0);
        Header::finish(buf);
    }

    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        if body.len() < 8 {
            return Err(Error::TooShort);
        }
        Ok(Self {
            nonce: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            port: u16::from_be_bytes([body[4], body[5]]),
        })
    }
}

/// One entry of a node list embedded in a find reply.
///
/// `addr = None` is the sender sentinel (zero port and address on the
/// wire); the receiver substitutes the datagram's source address.
///
/// # Test
///
/// ```
/// use warren_codec::Family;
/// use warren_codec::id::NodeId;
/// use warren_codec::messages::NodeRecord;
///
/// let rec = NodeRecord {
///     id: NodeId::from_bit(1),
///     addr: Some("10.0.0.9:4000".parse().unwrap()),
/// };
///
/// let mut buf = bytes::BytesMut::new();
/// rec.put(Family::Inet, &mut buf);
///
/// assert_eq!(buf.len(), NodeRecord::wire_len(Family::Inet));
/// assert_eq!(NodeRecord::get(Family::Inet, &buf).unwrap(), rec);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub addr: Option<SocketAddr>,
}

impl NodeRecord {
    pub fn wire_len(family: Family) -> usize {
        match family {
            Family::Inet6 => 2 + 2 + 16 + ID_LEN,
            _ => 2 + 2 + 4 + ID_LEN,
        }
    }

    pub fn put(&self, family: Family, buf: &mut BytesMut) {
        match self.addr {
            Some(addr) => {
                buf.put_u16(addr.port());
                buf.put_u16(0);
                match (family, addr.ip()) {
                    (Family::Inet6, IpAddr::V6(ip)) => buf.put_slice(&ip.octets()),
                    (Family::Inet6, IpAddr::V4(ip)) => {
                        buf.put_slice(&ip.to_ipv6_mapped().octets())
                    }
                    (_, IpAddr::V4(ip)) => buf.put_slice(&ip.octets()),
                    (_, IpAddr::V6(_)) => buf.put_u32(0),
                }
            }
            None => {
                buf.put_u16(0);
                buf.put_u16(0);
                buf.put_slice(&[0u8; 16][..if family == Family::Inet6 { 16 } else { 4 }]);
            }
        }
        buf.put_slice(self.id.as_bytes());
    }

    pub fn get(family: Family, b: &[u8]) -> Result<Self, Error> {
        if b.len() < Self::wire_len(family) {
            return Err(Error::TooShort);
        }

        let port = u16::from_be_bytes([b[0], b[1]]);
        let (ip, id_off): (IpAddr, usize) = match family {
            Family::Inet6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&b[4..20]);
                (IpAddr::V6(Ipv6Addr::from(octets)), 20)
            }
            _ => (IpAddr::V4(Ipv4Addr::new(b[4], b[5], b[6], b[7])), 8),
        };

        let is_sender = port == 0
            && match ip {
                IpAddr::V4(v4) => v4.octets() == [0; 4],
                IpAddr::V6(v6) => v6.octets() == [0; 16],
            };

        Ok(Self {
            id: NodeId::from_slice(&b[id_off..id_off + ID_LEN]),
            addr: if is_sender {
                None
            } else {
                Some(SocketAddr::new(ip, port))
            },
        })
    }
}

/// Find-node query, shared by both Kademlia realms.
///
/// `state` is the sender's reachability (`STATE_GLOBAL` / `STATE_NAT`) on
/// the DTUN side and zero padding on the DHT side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FindNode {
    pub nonce: u32,
    pub target: NodeId,
    pub family: Family,
    pub state: u16,
}

impl FindNode {
    pub fn encode(&self, kind: MsgType, src: &NodeId, dst: &NodeId, buf: &mut BytesMut) {
        Header::begin(kind, src, dst, buf);
        buf.put_u32(self.nonce);
        buf.put_slice(self.target.as_bytes());
        buf.put_u16(self.family.into());
        buf.put_u16(self.state);
        Header::finish(buf);
    }

    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        if body.len() < 4 + ID_LEN + 4 {
            return Err(Error::TooShort);
        }

        let family = u16::from_be_bytes([body[24], body[25]]);
        Ok(Self {
            nonce: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            target: NodeId::from_slice(&body[4..24]),
            family: Family::try_from(family).map_err(|_| Error::UnknownFamily(family))?,
            state: u16::from_be_bytes([body[26], body[27]]),
        })
    }
}

/// Find-node reply: the query nonce and target echoed back plus up to K
/// node records of the responder's closest known nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNodeReply {
    pub nonce: u32,
    pub target: NodeId,
    pub family: Family,
    pub nodes: Vec<NodeRecord>,
}

impl FindNodeReply {
    pub fn encode(&self, kind: MsgType, src: &NodeId, dst: &NodeId, buf: &mut BytesMut) {
        Header::begin(kind, src, dst, buf);
        buf.put_u32(self.nonce);
        buf.put_slice(self.target.as_bytes());
        buf.put_u16(self.family.into());
        buf.put_u8(self.nodes.len() as u8);
        buf.put_u8(0);
        for node in &self.nodes {
            node.put(self.family, buf);
        }
        Header::finish(buf);
    }

    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        if body.len() < 4 + ID_LEN + 4 {
            return Err(Error::TooShort);
        }

        let family = u16::from_be_bytes([body[24], body[25]]);
        let family = Family::try_from(family).map_err(|_| Error::UnknownFamily(family))?;
        let num = body[26] as usize;

        let mut nodes = Vec::with_capacity(num);
        let mut off = 28;
        for _ in 0..num {
            nodes.push(NodeRecord::get(family, &body[off..])?);
            off += NodeRecord::wire_len(family);
        }

        Ok(Self {
            nonce: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            target: NodeId::from_slice(&body[4..24]),
            family,
            nodes,
        })
    }
}

/// DTUN find-value reply.
///
/// `value` carries the registered endpoint of the target when the
/// responder holds a live registration (wire flag 1); otherwise the reply
/// degrades to a find-node reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DtunFindValueReply {
    pub nonce: u32,
    pub target: NodeId,
    pub family: Family,
    pub value: Option<NodeRecord>,
    pub nodes: Vec<NodeRecord>,
}

impl DtunFindValueReply {
    pub fn encode(&self, src: &NodeId, dst: &NodeId, buf: &mut BytesMut) {
        Header::begin(MsgType::DtunFindValueReply, src, dst, buf);
        buf.put_u32(self.nonce);
        buf.put_slice(self.target.as_bytes());
        buf.put_u16(self.family.into());
        match &self.value {
            Some(value) => {
                buf.put_u8(1);
                buf.put_u8(1);
                value.put(self.family, buf);
            }
            None => {
                buf.put_u8(self.nodes.len() as u8);
                buf.put_u8(0);
                for node in &self.nodes {
                    node.put(self.family, buf);
                }
            }
        }
        Header::finish(buf);
    }

    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        if body.len() < 4 + ID_LEN + 4 {
            return Err(Error::TooShort);
        }

        let family = u16::from_be_bytes([body[24], body[25]]);
        let family = Family::try_from(family).map_err(|_| Error::UnknownFamily(family))?;
        let num = body[26] as usize;
        let flag = body[27];

        let nonce = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let target = NodeId::from_slice(&body[4..24]);

        if flag == 1 {
            let value = NodeRecord::get(family, &body[28..])?;
            return Ok(Self {
                nonce,
                target,
                family,
                value: Some(value),
                nodes: Vec::new(),
            });
        }

        let mut nodes = Vec::with_capacity(num);
        let mut off = 28;
        for _ in 0..num {
            nodes.push(NodeRecord::get(family, &body[off..])?);
            off += NodeRecord::wire_len(family);
        }

        Ok(Self {
            nonce,
            target,
            family,
            value: None,
            nodes,
        })
    }
}

/// DHT find-value query: the target hash plus the exact key, so stores
/// holding several keys with colliding hashes can match precisely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhtFindValue {
    pub nonce: u32,
    pub target: NodeId,
    pub family: Family,
    pub key: Bytes,
}

impl DhtFindValue {
    pub fn encode(&self, src: &NodeId, dst: &NodeId, buf: &mut BytesMut) {
        Header::begin(MsgType::DhtFindValue, src, dst, buf);
        buf.put_u32(self.nonce);
        buf.put_slice(self.target.as_bytes());
        buf.put_u16(self.family.into());
        buf.put_u16(self.key.len() as u16);
        buf.put_slice(&self.key);
        Header::finish(buf);
    }

    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        if body.len() < 4 + ID_LEN + 4 {
            return Err(Error::TooShort);
        }

        let family = u16::from_be_bytes([body[24], body[25]]);
        let keylen = u16::from_be_bytes([body[26], body[27]]) as usize;
        if body.len() < 28 + keylen {
            return Err(Error::TooShort);
        }

        Ok(Self {
            nonce: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            target: NodeId::from_slice(&body[4..24]),
            family: Family::try_from(family).map_err(|_| Error::UnknownFamily(family))?,
            key: Bytes::copy_from_slice(&body[28..28 + keylen]),
        })
    }
}

/// Payload of a DHT find-value reply: either the values stored under the
/// key, or the closest nodes when the responder holds nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FindValuePayload {
    Values(Vec<Bytes>),
    Nodes(Vec<NodeRecord>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhtFindValueReply {
    pub nonce: u32,
    pub target: NodeId,
    pub family: Family,
    pub payload: FindValuePayload,
}

impl DhtFindValueReply {
    pub fn encode(&self, src: &NodeId, dst: &NodeId, buf: &mut BytesMut) {
        Header::begin(MsgType::DhtFindValueReply, src, dst, buf);
        buf.put_u32(self.nonce);
        buf.put_slice(self.target.as_bytes());
        buf.put_u16(self.family.into());
        match &self.payload {
            FindValuePayload::Values(values) => {
                buf.put_u8(values.len() as u8);
                buf.put_u8(1);
                for value in values {
                    buf.put_u16(value.len() as u16);
                    buf.put_slice(value);
                }
            }
            FindValuePayload::Nodes(nodes) => {
                buf.put_u8(nodes.len() as u8);
                buf.put_u8(0);
                for node in nodes {
                    node.put(self.family, buf);
                }
            }
        }
        Header::finish(buf);
    }

    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        if body.len() < 4 + ID_LEN + 4 {
            return Err(Error::TooShort);
        }

        let family = u16::from_be_bytes([body[24], body[25]]);
        let family = Family::try_from(family).map_err(|_| Error::UnknownFamily(family))?;
        let num = body[26] as usize;
        let flag = body[27];

        let payload = if flag == 1 {
            let mut values = Vec::with_capacity(num);
            let mut off = 28;
            for _ in 0..num {
                if body.len() < off + 2 {
                    return Err(Error::TooShort);
                }
                let vlen = u16::from_be_bytes([body[off], body[off + 1]]) as usize;
                if body.len() < off + 2 + vlen {
                    return Err(Error::TooShort);
                }
                values.push(Bytes::copy_from_slice(&body[off + 2..off + 2 + vlen]));
                off += 2 + vlen;
            }
            FindValuePayload::Values(values)
        } else {
            let mut nodes = Vec::with_capacity(num);
            let mut off = 28;
            for _ in 0..num {
                nodes.push(NodeRecord::get(family, &body[off..])?);
                off += NodeRecord::wire_len(family);
            }
            FindValuePayload::Nodes(nodes)
        };

        Ok(Self {
            nonce: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            target: NodeId::from_slice(&body[4..24]),
            family,
            payload,
        })
    }
}

/// Store a value under a key at the receiver.
///
/// `unique` replaces any previous value stored by the same originator for
/// this key instead of appending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Store {
    pub target: NodeId,
    pub ttl: u16,
    pub unique: bool,
    pub key: Bytes,
    pub value: Bytes,
}

impl Store {
    pub fn encode(&self, kind: MsgType, src: &NodeId, dst: &NodeId, buf: &mut BytesMut) {
        Header::begin(kind, src, dst, buf);
        buf.put_slice(self.target.as_bytes());
        buf.put_u16(self.key.len() as u16);
        buf.put_u16(self.value.len() as u16);
        buf.put_u16(self.ttl);
        buf.put_u16(u16::from(self.unique));
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);
        Header::finish(buf);
    }

    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        if body.len() < ID_LEN + 8 {
            return Err(Error::TooShort);
        }

        let keylen = u16::from_be_bytes([body[20], body[21]]) as usize;
        let valuelen = u16::from_be_bytes([body[22], body[23]]) as usize;
        if body.len() < ID_LEN + 8 + keylen + valuelen {
            return Err(Error::TooShort);
        }

        let key_off = ID_LEN + 8;
        Ok(Self {
            target: NodeId::from_slice(&body[0..20]),
            ttl: u16::from_be_bytes([body[24], body[25]]),
            unique: u16::from_be_bytes([body[26], body[27]]) & 1 != 0,
            key: Bytes::copy_from_slice(&body[key_off..key_off + keylen]),
            value: Bytes::copy_from_slice(&body[key_off + keylen..key_off + keylen + valuelen]),
        })
    }
}

/// DTUN registration: "this identifier is reachable at the endpoint this
/// datagram came from". The session nonce lets registrars detect restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    pub session: u32,
}

impl Register {
    pub fn encode(&self, src: &NodeId, dst: &NodeId, buf: &mut BytesMut) {
        Header::begin(MsgType::DtunRegister, src, dst, buf);
        buf.put_u32(self.session);
        Header::finish(buf);
    }

    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        if body.len() < 4 {
            return Err(Error::TooShort);
        }
        Ok(Self {
            session: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
        })
    }
}

/// Proxy registration carries a nonce besides the session so the client
/// can match the confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyRegister {
    pub session: u32,
    pub nonce: u32,
}

impl ProxyRegister {
    pub fn encode(&self, src: &NodeId, dst: &NodeId, buf: &mut BytesMut) {
        Header::begin(MsgType::ProxyRegister, src, dst, buf);
        buf.put_u32(self.session);
        buf.put_u32(self.nonce);
        Header::finish(buf);
    }

    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        if body.len() < 8 {
            return Err(Error::TooShort);
        }
        Ok(Self {
            session: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            nonce: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
        })
    }
}

/// Ask a registrar to relay a rendezvous toward `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub nonce: u32,
    pub target: NodeId,
}

impl Request {
    pub fn encode(&self, src: &NodeId, dst: &NodeId, buf: &mut BytesMut) {
        Header::begin(MsgType::DtunRequest, src, dst, buf);
        buf.put_u32(self.nonce);
        buf.put_slice(self.target.as_bytes());
        Header::finish(buf);
    }

    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        if body.len() < 4 + ID_LEN {
            return Err(Error::TooShort);
        }
        Ok(Self {
            nonce: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            target: NodeId::from_slice(&body[4..24]),
        })
    }
}

/// Relayed by a registrar to the registrant: "this endpoint is looking for
/// you". Receiving it makes the registrant's NAT open toward the
/// requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestBy {
    pub nonce: u32,
    pub requester: SocketAddr,
}

impl RequestBy {
    pub fn encode(&self, src: &NodeId, dst: &NodeId, buf: &mut BytesMut) {
        Header::begin(MsgType::DtunRequestBy, src, dst, buf);
        buf.put_u32(self.nonce);
        put_endpoint(buf, &self.requester);
        Header::finish(buf);
    }

    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        if body.len() < 4 + ENDPOINT_LEN {
            return Err(Error::TooShort);
        }
        Ok(Self {
            nonce: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            requester: get_endpoint(&body[4..])?,
        })
    }
}

/// Reverse-direction routing hint: "add me to your table".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advertise {
    pub nonce: u32,
    pub session: u32,
}

impl Advertise {
    pub fn encode(&self, src: &NodeId, dst: &NodeId, buf: &mut BytesMut) {
        Header::begin(MsgType::Advertise, src, dst, buf);
        buf.put_u32(self.nonce);
        buf.put_u32(self.session);
        Header::finish(buf);
    }

    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        if body.len() < 8 {
            return Err(Error::TooShort);
        }
        Ok(Self {
            nonce: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            session: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
        })
    }
}

/// Ask the proxy to run a DHT get on the sender's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyGet {
    pub nonce: u32,
    pub target: NodeId,
    pub key: Bytes,
}

impl ProxyGet {
    pub fn encode(&self, src: &NodeId, dst: &NodeId, buf: &mut BytesMut) {
        Header::begin(MsgType::ProxyGet, src, dst, buf);
        buf.put_u32(self.nonce);
        buf.put_slice(self.target.as_bytes());
        buf.put_u16(self.key.len() as u16);
        buf.put_slice(&self.key);
        Header::finish(buf);
    }

    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        if body.len() < 4 + ID_LEN + 2 {
            return Err(Error::TooShort);
        }

        let keylen = u16::from_be_bytes([body[24], body[25]]) as usize;
        if body.len() < 26 + keylen {
            return Err(Error::TooShort);
        }

        Ok(Self {
            nonce: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            target: NodeId::from_slice(&body[4..24]),
            key: Bytes::copy_from_slice(&body[26..26 + keylen]),
        })
    }
}

/// Result of a proxied get. `values = None` means the lookup failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyGetReply {
    pub nonce: u32,
    pub values: Option<Vec<Bytes>>,
}

impl ProxyGetReply {
    pub fn encode(&self, src: &NodeId, dst: &NodeId, buf: &mut BytesMut) {
        Header::begin(MsgType::ProxyGetReply, src, dst, buf);
        buf.put_u32(self.nonce);
        match &self.values {
            Some(values) => {
                buf.put_u8(1);
                buf.put_u8(values.len() as u8);
                for value in values {
                    buf.put_u16(value.len() as u16);
                    buf.put_slice(value);
                }
            }
            None => {
                buf.put_u8(0);
                buf.put_u8(0);
            }
        }
        Header::finish(buf);
    }

    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        if body.len() < 6 {
            return Err(Error::TooShort);
        }

        let nonce = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        if body[4] == 0 {
            return Ok(Self {
                nonce,
                values: None,
            });
        }

        let num = body[5] as usize;
        let mut values = Vec::with_capacity(num);
        let mut off = 6;
        for _ in 0..num {
            if body.len() < off + 2 {
                return Err(Error::TooShort);
            }
            let vlen = u16::from_be_bytes([body[off], body[off + 1]]) as usize;
            if body.len() < off + 2 + vlen {
                return Err(Error::TooShort);
            }
            values.push(Bytes::copy_from_slice(&body[off + 2..off + 2 + vlen]));
            off += 2 + vlen;
        }

        Ok(Self {
            nonce,
            values: Some(values),
        })
    }
}

/// Encode a raw-payload frame (dgram, rdp and their proxied variants).
pub fn encode_payload(
    kind: MsgType,
    src: &NodeId,
    dst: &NodeId,
    payload: &[u8],
    buf: &mut BytesMut,
) {
    Header::begin(kind, src, dst, buf);
    buf.put_slice(payload);
    Header::finish(buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_body(buf: &BytesMut) -> &[u8] {
        let (_, body) = Header::decode(buf).unwrap();
        body
    }

    #[test]
    fn echo_reply_round_trip() {
        let msg = EchoReply {
            nonce: 0xdeadbeef,
            observed: "192.0.2.7:3939".parse().unwrap(),
        };

        let mut buf = BytesMut::new();
        msg.encode(
            MsgType::NatEchoReply,
            &NodeId::from_bit(0),
            &NodeId::from_bit(1),
            &mut buf,
        );

        assert_eq!(EchoReply::decode(decode_body(&buf)).unwrap(), msg);
    }

    #[test]
    fn echo_reply_round_trip_v6() {
        let msg = EchoReply {
            nonce: 7,
            observed: "[2001:db8::1]:9000".parse().unwrap(),
        };

        let mut buf = BytesMut::new();
        msg.encode(
            MsgType::NatEchoRedirectReply,
            &NodeId::from_bit(0),
            &NodeId::from_bit(1),
            &mut buf,
        );

        assert_eq!(EchoReply::decode(decode_body(&buf)).unwrap(), msg);
    }

    #[test]
    fn find_node_reply_with_sender_sentinel() {
        let msg = FindNodeReply {
            nonce: 42,
            target: NodeId::sha1(b"t"),
            family: Family::Inet,
            nodes: vec![
                NodeRecord {
                    id: NodeId::from_bit(9),
                    addr: None,
                },
                NodeRecord {
                    id: NodeId::from_bit(10),
                    addr: Some("198.51.100.4:1234".parse().unwrap()),
                },
            ],
        };

        let mut buf = BytesMut::new();
        msg.encode(
            MsgType::DhtFindNodeReply,
            &NodeId::from_bit(0),
            &NodeId::from_bit(1),
            &mut buf,
        );

        let decoded = FindNodeReply::decode(decode_body(&buf)).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.nodes[0].addr, None);
    }

    #[test]
    fn dtun_find_value_reply_value_wins() {
        let msg = DtunFindValueReply {
            nonce: 1,
            target: NodeId::from_bit(77),
            family: Family::Inet,
            value: Some(NodeRecord {
                id: NodeId::from_bit(77),
                addr: Some("203.0.113.2:5000".parse().unwrap()),
            }),
            nodes: Vec::new(),
        };

        let mut buf = BytesMut::new();
        msg.encode(&NodeId::from_bit(0), &NodeId::from_bit(1), &mut buf);

        let decoded = DtunFindValueReply::decode(decode_body(&buf)).unwrap();
        assert!(decoded.value.is_some());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn store_round_trip() {
        let msg = Store {
            target: NodeId::sha1(b"key"),
            ttl: 300,
            unique: true,
            key: Bytes::from_static(b"key"),
            value: Bytes::from_static(b"value"),
        };

        let mut buf = BytesMut::new();
        msg.encode(
            MsgType::DhtStore,
            &NodeId::from_bit(0),
            &NodeId::from_bit(1),
            &mut buf,
        );

        assert_eq!(Store::decode(decode_body(&buf)).unwrap(), msg);
    }

    #[test]
    fn dht_find_value_reply_values() {
        let msg = DhtFindValueReply {
            nonce: 5,
            target: NodeId::sha1(b"k"),
            family: Family::Inet,
            payload: FindValuePayload::Values(vec![
                Bytes::from_static(b"one"),
                Bytes::from_static(b"two"),
            ]),
        };

        let mut buf = BytesMut::new();
        msg.encode(&NodeId::from_bit(0), &NodeId::from_bit(1), &mut buf);

        assert_eq!(DhtFindValueReply::decode(decode_body(&buf)).unwrap(), msg);
    }

    #[test]
    fn truncated_bodies_are_rejected() {
        let msg = Store {
            target: NodeId::sha1(b"key"),
            ttl: 60,
            unique: false,
            key: Bytes::from_static(b"key"),
            value: Bytes::from_static(b"value"),
        };

        let mut buf = BytesMut::new();
        msg.encode(
            MsgType::DhtStore,
            &NodeId::from_bit(0),
            &NodeId::from_bit(1),
            &mut buf,
        );

        let (_, body) = Header::decode(&buf).unwrap();
        assert_eq!(
            Store::decode(&body[..body.len() - 3]).unwrap_err(),
            Error::TooShort
        );
    }
}
