//! Walk snapshots — neighbours of the current peer and the immutable
//! `Memento` the walk rolls back to.
//!
//! Neighbour state machine, one round per current peer:
//!
//!   Unresponsive ──(ping sent)──▶ Contacted ──(pong)────▶ Responsive
//!        │                            └──(timeout)──▶ Unreachable
//!        └──────(dispatch failed)─────────────────────▶ Unreachable
//!
//! Responsive and Unreachable are terminal for the round.

use hastings_core::{CorrelationId, PeerHandle};
use serde::{Deserialize, Serialize};

/// Per-round state of one neighbour of the current peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NeighbourState {
    /// Known, not yet pinged this round.
    Unresponsive,
    /// Ping sent, waiting for the response or the TTL.
    Contacted,
    /// Answered our ping. A candidate for the next step.
    Responsive,
    /// Ping timed out or could not be sent.
    Unreachable,
}

impl NeighbourState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NeighbourState::Responsive | NeighbourState::Unreachable)
    }
}

/// A neighbour of the current peer.
///
/// Fields are private: only the `Originator` moves a neighbour through its
/// states, everyone else reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbour {
    peer: PeerHandle,
    state: NeighbourState,
    ping_correlation_id: Option<CorrelationId>,
}

impl Neighbour {
    pub fn new(peer: PeerHandle) -> Self {
        Self {
            peer,
            state: NeighbourState::Unresponsive,
            ping_correlation_id: None,
        }
    }

    pub fn peer(&self) -> &PeerHandle {
        &self.peer
    }

    pub fn state(&self) -> NeighbourState {
        self.state
    }

    pub fn ping_correlation_id(&self) -> Option<CorrelationId> {
        self.ping_correlation_id
    }

    pub(crate) fn set_state(&mut self, state: NeighbourState) {
        self.state = state;
    }

    pub(crate) fn set_ping_correlation_id(&mut self, id: Option<CorrelationId>) {
        self.ping_correlation_id = id;
    }

    #[cfg(test)]
    pub(crate) fn with_state(peer: PeerHandle, state: NeighbourState) -> Self {
        Self {
            peer,
            state,
            ping_correlation_id: None,
        }
    }
}

/// Immutable snapshot of one walk round: the current peer and a deep copy
/// of its neighbours.
///
/// There are no mutators. Restoring reads the snapshot and copies out of
/// it, so the same memento can be restored any number of times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memento {
    peer: PeerHandle,
    neighbours: Vec<Neighbour>,
}

impl Memento {
    pub fn new(peer: PeerHandle, neighbours: Vec<Neighbour>) -> Self {
        Self { peer, neighbours }
    }

    pub fn peer(&self) -> &PeerHandle {
        &self.peer
    }

    pub fn neighbours(&self) -> &[Neighbour] {
        &self.neighbours
    }
}
