//! 160-bit identifiers and the XOR distance metric.

use std::fmt;

use sha1::{Digest, Sha1};

/// Width of an identifier in bytes. Matches the wire header's `source_id`
/// and `random_token` fields, and the output width of [`Id::hash`].
pub const ID_LEN: usize = 20;

/// A 160-bit identifier: a node ID, a key hash, or a random correlation
/// token. All three share the same representation and the same XOR metric.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id([u8; ID_LEN]);

impl Id {
    pub const ZERO: Id = Id([0u8; ID_LEN]);

    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Id(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Draws a uniformly random identifier, a whole machine word at a time.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LEN];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
        Id(bytes)
    }

    /// Hashes an arbitrary key into the 160-bit ID space.
    ///
    /// Fixed to SHA-1 so that every node in a deployment agrees on where a
    /// key lives; this is the hash the wire format's 20-byte key fields
    /// assume.
    pub fn hash(key: &[u8]) -> Self {
        let digest = Sha1::digest(key);
        let mut bytes = [0u8; ID_LEN];
        bytes.copy_from_slice(&digest);
        Id(bytes)
    }

    /// XOR distance to another identifier.
    pub fn distance(&self, other: &Id) -> Distance {
        let mut out = [0u8; ID_LEN];
        for i in 0..ID_LEN {
            out[i] = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", hex::encode(self.0))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// The XOR distance between two [`Id`]s, ordered as an unsigned 160-bit
/// integer (most significant byte first).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance([u8; ID_LEN]);

impl Distance {
    /// Index (0..=160, from the most significant bit) of the highest set
    /// bit, i.e. the trie depth at which the two IDs diverge. Returns
    /// `None` when the distance is zero (identical IDs).
    pub fn leading_zero_bits(&self) -> Option<u32> {
        for (byte_index, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return Some((byte_index as u32) * 8 + byte.leading_zeros());
            }
        }
        None
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(self.0))
    }
}
