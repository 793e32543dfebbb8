//! Peer and request identifiers shared by every Hastings crate.
//!
//! A `PeerHandle` names a remote node by the address it listens on plus the
//! BLAKE3 fingerprint of its node key. Handles are plain values: cloned,
//! compared and hashed freely, never mutated after construction.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

// ── PeerHandle ────────────────────────────────────────────────────────────────

/// Opaque, comparable identifier for a network peer.
///
/// Ordering is lexicographic on (address, fingerprint). Candidate selection
/// relies on this order being total and stable across nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerHandle {
    addr: SocketAddr,
    fingerprint: [u8; 32],
}

impl PeerHandle {
    /// Build a handle from an address and the peer's public node key.
    pub fn new(addr: SocketAddr, public_key: &[u8]) -> Self {
        Self {
            addr,
            fingerprint: fingerprint(public_key),
        }
    }

    /// Build a handle from an already computed fingerprint.
    pub fn from_parts(addr: SocketAddr, fingerprint: [u8; 32]) -> Self {
        Self { addr, fingerprint }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn fingerprint(&self) -> &[u8; 32] {
        &self.fingerprint
    }

    /// First 8 fingerprint bytes as hex. Used in log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.fingerprint[..8])
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", hex::encode(self.fingerprint), self.addr)
    }
}

/// Parse the `"<fingerprint-hex>@<ip:port>"` form used in config files.
impl FromStr for PeerHandle {
    type Err = PeerHandleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (fp_hex, addr) = s
            .trim()
            .split_once('@')
            .ok_or_else(|| PeerHandleParseError::MissingSeparator(s.to_string()))?;

        let bytes = hex::decode(fp_hex)
            .map_err(|_| PeerHandleParseError::BadFingerprint(fp_hex.to_string()))?;
        let fingerprint: [u8; 32] = bytes
            .try_into()
            .map_err(|_| PeerHandleParseError::BadFingerprint(fp_hex.to_string()))?;

        let addr = addr
            .parse()
            .map_err(|_| PeerHandleParseError::BadAddress(addr.to_string()))?;

        Ok(Self { addr, fingerprint })
    }
}

/// BLAKE3 fingerprint of a public node key.
pub fn fingerprint(public_key: &[u8]) -> [u8; 32] {
    *blake3::hash(public_key).as_bytes()
}

// ── CorrelationId ─────────────────────────────────────────────────────────────

/// Unique token linking a request to its eventual response.
///
/// 128 random bits; collisions are treated as a dispatch bug, never as a
/// routine event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId([u8; 16]);

impl CorrelationId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerHandleParseError {
    #[error("expected <fingerprint>@<addr>, got {0:?}")]
    MissingSeparator(String),
    #[error("fingerprint must be 64 hex chars, got {0:?}")]
    BadFingerprint(String),
    #[error("invalid socket address {0:?}")]
    BadAddress(String),
}
