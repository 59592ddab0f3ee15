// ring-node/src/id.rs
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use rand::Rng;
use thiserror::Error;

/// Number of points on the identifier ring.
pub const RING_SIZE: u32 = 1 << 16;

/// Number of hex digits in an identifier, and rows in a routing table.
pub const DIGITS: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid identifier {0:?}: expected 4 hex digits")]
pub struct ParseIdentifierError(pub String);

/// A point on the 16-bit identifier ring, shared by peers and file keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(u16);

impl Identifier {
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub fn random() -> Self {
        Self(rand::thread_rng().gen())
    }

    pub fn value(self) -> u16 {
        self.0
    }

    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; 2]) -> Self {
        Self(u16::from_be_bytes(bytes))
    }

    /// Value of the hex digit at `index`, most significant first.
    pub fn digit(self, index: usize) -> usize {
        debug_assert!(index < DIGITS);
        ((self.0 >> (4 * (DIGITS - 1 - index))) & 0xF) as usize
    }

    /// Index of the first hex digit where the two identifiers differ.
    /// Identical identifiers report the last index.
    pub fn first_difference(self, other: Identifier) -> usize {
        (0..DIGITS)
            .find(|&i| self.digit(i) != other.digit(i))
            .unwrap_or(DIGITS - 1)
    }

    /// How far `other` lies clockwise of `self`.
    pub fn clockwise_to(self, other: Identifier) -> u32 {
        other.0.wrapping_sub(self.0) as u32
    }

    /// How far `other` lies counterclockwise of `self`.
    pub fn counterclockwise_to(self, other: Identifier) -> u32 {
        (RING_SIZE - self.clockwise_to(other)) % RING_SIZE
    }

    /// Cyclic distance: the shorter way around the ring.
    pub fn distance_to(self, other: Identifier) -> u32 {
        self.clockwise_to(other).min(self.counterclockwise_to(other))
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_bytes()))
    }
}

impl FromStr for Identifier {
    type Err = ParseIdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != DIGITS {
            return Err(ParseIdentifierError(s.to_string()));
        }
        let mut bytes = [0u8; 2];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| ParseIdentifierError(s.to_string()))?;
        Ok(Self::from_bytes(bytes))
    }
}

/// Derive the ring key for a stored file from its name.
pub fn key_for_filename(filename: &str) -> Identifier {
    let digest = blake3::hash(filename.as_bytes());
    let bytes = digest.as_bytes();
    Identifier::from_bytes([bytes[0], bytes[1]])
}

/// A peer as seen by the overlay.
///
/// Equality and hashing look at the identifier only: a peer that comes back
/// with the same identifier on a different address is the same peer to anyone
/// who has not heard otherwise.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub id: Identifier,
    pub host: String,
    pub port: u16,
}

impl PeerIdentity {
    pub fn new(id: Identifier, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerIdentity {}

impl Hash for PeerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- {}:{}", self.id, self.host, self.port)
    }
}
