//! Boundary to the peer transport.
//!
//! The walk only needs to send two requests and to be told about responses.
//! Framing, encoding and delivery belong to whoever implements
//! `PeerMessaging`; responses come back on an mpsc stream as
//! `InboundResponse`s keyed by correlation id and sender.

use hastings_core::{CorrelationId, PeerHandle};

#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("peer {0} unreachable")]
    Unreachable(PeerHandle),
    #[error("transport closed")]
    Closed,
    #[error("failed to encode request: {0}")]
    Encode(String),
}

/// Outbound side of the transport. Each send allocates a fresh correlation
/// id and returns it once the request is on its way.
pub trait PeerMessaging: Send + Sync {
    fn send_neighbours_request(&self, peer: &PeerHandle) -> Result<CorrelationId, MessagingError>;

    fn send_ping(&self, peer: &PeerHandle) -> Result<CorrelationId, MessagingError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    Pong,
    Neighbours(Vec<PeerHandle>),
}

/// A response delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundResponse {
    pub correlation_id: CorrelationId,
    pub sender: PeerHandle,
    pub kind: ResponseKind,
}
