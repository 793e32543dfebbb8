//! Discovery datagram format used by the reference UDP transport.
//!
//! One JSON-encoded `Envelope` per datagram. Framing, encryption and
//! signing belong to a real transport and are deliberately absent: the
//! discovery walk only needs the correlation id, the sender handle and the
//! message kind.

use serde::{Deserialize, Serialize};

use crate::peer::{CorrelationId, PeerHandle};

/// Largest datagram we will encode or accept.
pub const MAX_DATAGRAM: usize = 8 * 1024;

/// Default number of peers returned in a neighbours response.
pub const DEFAULT_NEIGHBOUR_COUNT: usize = 5;

/// Discovery protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    PingRequest,
    PingResponse,
    PeerNeighboursRequest,
    PeerNeighboursResponse { peers: Vec<PeerHandle> },
}

/// A single datagram. Responses echo the request's correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub correlation_id: CorrelationId,
    pub sender: PeerHandle,
    pub payload: Payload,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let bytes = serde_json::to_vec(self).map_err(|e| WireError::Encode(e.to_string()))?;
        if bytes.len() > MAX_DATAGRAM {
            return Err(WireError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() > MAX_DATAGRAM {
            return Err(WireError::TooLarge(bytes.len()));
        }
        serde_json::from_slice(bytes).map_err(|e| WireError::Decode(e.to_string()))
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram of {0} bytes exceeds maximum {}", MAX_DATAGRAM)]
    TooLarge(usize),
    #[error("failed to encode envelope: {0}")]
    Encode(String),
    #[error("failed to decode envelope: {0}")]
    Decode(String),
}
