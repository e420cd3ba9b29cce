//! # Node Identifiers and Contacts
//!
//! This module defines the core identity types used throughout kadfs:
//!
//! - [`NodeId`]: 160-bit opaque identifier for nodes and stored keys
//! - [`Contact`]: (NodeId, host, port) triple identifying a reachable peer
//!
//! ## Identity Model
//!
//! Identifiers are drawn uniformly at random at node startup; keys share the
//! same 160-bit space, so nodes and values live in one XOR metric. The same
//! type serves both roles.
//!
//! ## XOR Metric
//!
//! `distance(a, b) = a XOR b`, compared lexicographically big-endian. The
//! number of leading zero bits of a distance (its *prefix length*) is the
//! routing-table bucket index: 0 for the farthest half of the keyspace, up
//! to 160 for a node's distance to itself.
//!
//! ## Invariants
//!
//! - `NodeId::from_hex(id.to_hex()) == id` (round-trip preservation)
//! - `to_hex` always yields exactly 40 lowercase hex characters
//! - `prefix_len(a.distance(a)) == 160`
//! - XOR distance is symmetric and satisfies the triangle inequality

use std::cmp::Ordering;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Identifier width in bytes.
pub const ID_BYTES: usize = 20;

/// Identifier width in bits; also the number of routing-table buckets.
pub const ID_BITS: usize = ID_BYTES * 8;

/// A 160-bit node or key identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct NodeId([u8; ID_BYTES]);

/// XOR distance between two identifiers.
pub type Distance = [u8; ID_BYTES];

/// Failure to parse an identifier from its 40-char hex rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseIdError {
    /// Input was not exactly 40 characters long.
    BadLength(usize),
    /// Input contained a non-hex character.
    BadDigit,
}

impl std::fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseIdError::BadLength(got) => {
                write!(f, "invalid hex id: expected 40 chars, got {}", got)
            }
            ParseIdError::BadDigit => write!(f, "invalid hex id: non-hex character"),
        }
    }
}

impl std::error::Error for ParseIdError {}

impl NodeId {
    /// Construct from raw bytes.
    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Draw a fresh identifier from a uniform distribution.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw 20-byte representation.
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// XOR distance to another identifier.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Number of leading zero bits of `self XOR other`, in `0..=160`.
    ///
    /// Doubles as the bucket index for `other` in a routing table owned by
    /// `self`; equal identifiers yield 160.
    pub fn prefix_len(&self, other: &NodeId) -> usize {
        prefix_len(&self.distance(other))
    }

    /// Render as 40 lowercase hex characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from exactly 40 hex characters (either case accepted).
    pub fn from_hex(s: &str) -> Result<Self, ParseIdError> {
        if s.len() != ID_BYTES * 2 {
            return Err(ParseIdError::BadLength(s.len()));
        }
        let decoded = hex::decode(s).map_err(|_| ParseIdError::BadDigit)?;
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }
}

/// Count leading zero bits of a distance. The all-zero distance yields 160.
pub fn prefix_len(dist: &Distance) -> usize {
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    ID_BITS
}

/// Compare two XOR distances lexicographically.
///
/// Used to determine which of two identifiers is closer to a target in the
/// XOR metric space.
#[inline]
pub fn distance_cmp(a: &Distance, b: &Distance) -> Ordering {
    a.cmp(b)
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; ID_BYTES]> for NodeId {
    fn from(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }
}

impl From<NodeId> for [u8; ID_BYTES] {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A reachable peer: identifier plus transport address.
///
/// Contacts are value types, freely copied into buckets and shortlists.
/// Two contacts denote the same peer iff their `id`s are equal; the address
/// may drift over a node's lifetime and is overwritten on refresh.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
}

impl Contact {
    pub fn new(id: NodeId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
        }
    }

    /// Dialable "host:port" rendering.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for Contact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.addr())
    }
}
