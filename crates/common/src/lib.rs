//! dotkv-common: shared types for the dotkv project.
//!
//! Provides the `(bucket, key)` identifier, the 160-bit ring position
//! derived from it, and the vnode identity `(partition, epoch)` that
//! tags every dot in the causal clocks.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

/// Number of bits in a ring position.
pub const POS_BITS: usize = 160;

/// Number of bytes in a ring position.
pub const POS_BYTES: usize = POS_BITS / 8; // 20

/// Name of a cluster node as reported by the membership layer.
pub type NodeName = String;

// ---------------------------------------------------------------------------
// Bkey
// ---------------------------------------------------------------------------

/// The `(bucket, key)` identifier used everywhere. Both halves are
/// arbitrary byte strings.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Bkey {
    pub bucket: Vec<u8>,
    pub key: Vec<u8>,
}

impl Bkey {
    pub fn new(bucket: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Serialize to the unambiguous storage-key form:
    /// `[u32 LE bucket length][bucket][key]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.bucket.len() + self.key.len());
        out.extend_from_slice(&(self.bucket.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.bucket);
        out.extend_from_slice(&self.key);
        out
    }

    /// Inverse of [`Bkey::encode`]. Returns `None` on malformed input.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 4 {
            return None;
        }
        let blen = u32::from_le_bytes(bytes[..4].try_into().ok()?) as usize;
        if bytes.len() < 4 + blen {
            return None;
        }
        Some(Self {
            bucket: bytes[4..4 + blen].to_vec(),
            key: bytes[4 + blen..].to_vec(),
        })
    }

    /// The key's position on the ring: `sha1(bucket || key)`.
    pub fn ring_position(&self) -> RingPos {
        let mut hasher = Sha1::new();
        hasher.update(&self.bucket);
        hasher.update(&self.key);
        let hash = hasher.finalize();
        let mut bytes = [0u8; POS_BYTES];
        bytes.copy_from_slice(&hash);
        RingPos(bytes)
    }
}

impl fmt::Debug for Bkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bkey({}/{})",
            String::from_utf8_lossy(&self.bucket),
            String::from_utf8_lossy(&self.key)
        )
    }
}

impl fmt::Display for Bkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            String::from_utf8_lossy(&self.bucket),
            String::from_utf8_lossy(&self.key)
        )
    }
}

// ---------------------------------------------------------------------------
// RingPos
// ---------------------------------------------------------------------------

/// A 160-bit unsigned position on the consistent-hash ring.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RingPos([u8; POS_BYTES]);

impl RingPos {
    pub const ZERO: Self = Self([0u8; POS_BYTES]);

    pub fn from_bytes(bytes: [u8; POS_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; POS_BYTES] {
        &self.0
    }

    /// The top `bits` bits of the position as an integer. The ring maps
    /// a position to a partition index by truncating to the partition
    /// exponent, so `bits` is at most 32.
    pub fn top_bits(&self, bits: u8) -> u32 {
        assert!((1..=32).contains(&bits), "top_bits supports 1..=32 bits");
        let head = u64::from_be_bytes(self.0[..8].try_into().expect("8-byte slice"));
        (head >> (64 - bits as u64)) as u32
    }
}

impl fmt::Debug for RingPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RingPos({})", self)
    }
}

impl fmt::Display for RingPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 4 bytes as hex for readability
        write!(f, "{}…", hex::encode(&self.0[..4]))
    }
}

// ---------------------------------------------------------------------------
// VnodeId / Dot
// ---------------------------------------------------------------------------

/// Identity of a vnode: partition index plus a restart epoch.
///
/// The epoch increments on every (re)open of the vnode's storage, so dots
/// assigned after a restart can never collide with dots issued before it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VnodeId {
    pub index: u32,
    pub epoch: u32,
}

impl VnodeId {
    pub fn new(index: u32, epoch: u32) -> Self {
        Self { index, epoch }
    }
}

impl fmt::Debug for VnodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VnodeId({}.{})", self.index, self.epoch)
    }
}

impl fmt::Display for VnodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.epoch)
    }
}

/// A dot: globally unique label for a single write event.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dot {
    pub id: VnodeId,
    pub counter: u64,
}

impl Dot {
    pub fn new(id: VnodeId, counter: u64) -> Self {
        Self { id, counter }
    }
}

impl fmt::Debug for Dot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dot({}#{})", self.id, self.counter)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
