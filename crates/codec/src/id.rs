use std::fmt;
use std::ops::{BitAnd, BitXor, Not, Shl, Shr};

use aws_lc_rs::digest;

use crate::Error;

/// Width of an overlay identifier in bytes.
pub const ID_LEN: usize = 20;

/// Number of bits in an overlay identifier.
pub const ID_BITS: usize = ID_LEN * 8;

/// A 160-bit overlay identifier.
///
/// Identifiers form a flat address space ordered as big-endian unsigned
/// integers. Closeness between two identifiers is their XOR treated as an
/// integer, which is what the routing table and every lookup sort by.
///
/// # Test
///
/// ```
/// use warren_codec::id::NodeId;
///
/// let a = NodeId::from_hex("00000000000000000000000000000000000000ff").unwrap();
/// let b = NodeId::from_hex("0000000000000000000000000000000000000f00").unwrap();
///
/// assert_eq!((a ^ b) ^ b, a);
/// assert!(a < b);
/// assert_eq!(a.to_string(), "00000000000000000000000000000000000000ff");
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    /// The all-zero identifier, used on the wire as "unknown destination".
    pub const ZERO: NodeId = NodeId([0u8; ID_LEN]);

    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build an identifier from arbitrary-length input.
    ///
    /// Input longer than 20 bytes is truncated from the tail; shorter input
    /// is right-padded with zeros.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut id = [0u8; ID_LEN];
        let n = bytes.len().min(ID_LEN);
        id[..n].copy_from_slice(&bytes[..n]);
        Self(id)
    }

    /// SHA-1 of `data`, which is exactly 160 bits wide.
    pub fn sha1(data: &[u8]) -> Self {
        let d = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, data);
        Self::from_slice(d.as_ref())
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// The identifier as 5 big-endian 32-bit words, most significant first.
    pub fn to_words(self) -> [u32; 5] {
        let mut w = [0u32; 5];
        for (i, word) in w.iter_mut().enumerate() {
            *word = u32::from_be_bytes([
                self.0[i * 4],
                self.0[i * 4 + 1],
                self.0[i * 4 + 2],
                self.0[i * 4 + 3],
            ]);
        }
        w
    }

    pub fn from_words(words: [u32; 5]) -> Self {
        let mut bytes = [0u8; ID_LEN];
        for (i, word) in words.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }
        Self(bytes)
    }

    pub fn from_hex(hex: &str) -> Result<Self, Error> {
        if hex.len() != ID_LEN * 2 {
            return Err(Error::InvalidInput);
        }

        let mut bytes = [0u8; ID_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidInput)?;
        }

        Ok(Self(bytes))
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// An identifier with only bit `i` set, bit 0 being least significant.
    pub fn from_bit(i: usize) -> Self {
        debug_assert!(i < ID_BITS);
        let mut bytes = [0u8; ID_LEN];
        bytes[ID_LEN - 1 - i / 8] = 1 << (i % 8);
        Self(bytes)
    }

    pub fn leading_zeros(&self) -> u32 {
        let mut n = 0;
        for byte in self.0 {
            if byte == 0 {
                n += 8;
            } else {
                n += byte.leading_zeros();
                break;
            }
        }
        n
    }

    /// XOR distance to `other`.
    pub fn distance(&self, other: &NodeId) -> NodeId {
        *self ^ *other
    }

    /// Position of the highest bit in which `self` and `other` differ,
    /// in `[0, 159]`, or `None` when the identifiers are equal.
    ///
    /// This is the k-bucket index of `other` relative to `self`.
    ///
    /// # Test
    ///
    /// ```
    /// use warren_codec::id::NodeId;
    ///
    /// let a = NodeId::ZERO;
    /// let b = NodeId::from_bit(7);
    ///
    /// assert_eq!(a.bucket_index(&b), Some(7));
    /// assert_eq!(a.bucket_index(&a), None);
    /// ```
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        let d = self.distance(other);
        if d.is_zero() {
            None
        } else {
            Some(ID_BITS - 1 - d.leading_zeros() as usize)
        }
    }
}

impl BitXor for NodeId {
    type Output = NodeId;

    fn bitxor(self, rhs: NodeId) -> NodeId {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ rhs.0[i];
        }
        NodeId(out)
    }
}

impl BitAnd for NodeId {
    type Output = NodeId;

    fn bitand(self, rhs: NodeId) -> NodeId {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] & rhs.0[i];
        }
        NodeId(out)
    }
}

impl Not for NodeId {
    type Output = NodeId;

    fn not(self) -> NodeId {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = !self.0[i];
        }
        NodeId(out)
    }
}

impl Shl<u32> for NodeId {
    type Output = NodeId;

    fn shl(self, n: u32) -> NodeId {
        if n as usize >= ID_BITS {
            return NodeId::ZERO;
        }

        let w = self.to_words();
        let word_shift = (n / 32) as usize;
        let bit_shift = n % 32;
        let mut out = [0u32; 5];

        for i in 0..5 {
            let src = i + word_shift;
            if src < 5 {
                out[i] = w[src] << bit_shift;
                if bit_shift > 0 && src + 1 < 5 {
                    out[i] |= w[src + 1] >> (32 - bit_shift);
                }
            }
        }

        NodeId::from_words(out)
    }
}

impl Shr<u32> for NodeId {
    type Output = NodeId;

    fn shr(self, n: u32) -> NodeId {
        if n as usize >= ID_BITS {
            return NodeId::ZERO;
        }

        let w = self.to_words();
        let word_shift = (n / 32) as usize;
        let bit_shift = n % 32;
        let mut out = [0u32; 5];

        for i in (0..5).rev() {
            if i < word_shift {
                continue;
            }

            let dst = i;
            let src = i - word_shift;
            out[dst] = w[src] >> bit_shift;
            if bit_shift > 0 && src > 0 {
                out[dst] |= w[src - 1] << (32 - bit_shift);
            }
        }

        NodeId::from_words(out)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_is_involutive() {
        let a = NodeId::from_slice(&[0x12, 0x34, 0x56]);
        let b = NodeId::from_slice(&[0xff; 20]);

        assert_eq!((a ^ b) ^ b, a);
        assert_eq!(a ^ a, NodeId::ZERO);
    }

    #[test]
    fn ordering_is_big_endian_numeric() {
        let small = NodeId::from_bit(0);
        let big = NodeId::from_bit(159);

        assert!(small < big);
        assert!(NodeId::ZERO < small);
    }

    #[test]
    fn word_round_trip() {
        let id = NodeId::from_words([1, 2, 3, 4, 5]);
        assert_eq!(NodeId::from_words(id.to_words()), id);
        assert_eq!(id.as_bytes()[3], 1);
        assert_eq!(id.as_bytes()[19], 5);
    }

    #[test]
    fn hex_round_trip() {
        let id = NodeId::sha1(b"warren");
        let again = NodeId::from_hex(&id.to_string()).unwrap();
        assert_eq!(id, again);

        assert!(NodeId::from_hex("xyz").is_err());
    }

    #[test]
    fn slice_policy_pads_and_truncates() {
        let short = NodeId::from_slice(&[0xab]);
        assert_eq!(short.as_bytes()[0], 0xab);
        assert!(short.as_bytes()[1..].iter().all(|b| *b == 0));

        let long = NodeId::from_slice(&[0x11; 32]);
        assert_eq!(long, NodeId::from_slice(&[0x11; 20]));
    }

    #[test]
    fn shifts() {
        let one = NodeId::from_bit(0);
        assert_eq!(one << 159, NodeId::from_bit(159));
        assert_eq!(NodeId::from_bit(159) >> 159, one);
        assert_eq!(one << 160, NodeId::ZERO);
        assert_eq!((one << 33) >> 33, one);
    }

    #[test]
    fn bucket_index_is_msb_of_xor() {
        let base = NodeId::ZERO;
        for i in [0usize, 1, 7, 8, 31, 32, 64, 100, 159] {
            assert_eq!(base.bucket_index(&NodeId::from_bit(i)), Some(i));
        }

        let a = NodeId::from_slice(&[0x80]);
        let b = NodeId::from_slice(&[0xc0]);
        assert_eq!(a.bucket_index(&b), Some(158));
    }
}
