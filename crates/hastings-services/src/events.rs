//! Events the discovery walk publishes to outside subscribers.

use hastings_core::PeerHandle;

use crate::memento::NeighbourState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A peer past the burn-in was added to the peer store.
    Discovered(PeerHandle),
    /// A neighbour of the current peer changed state.
    NeighbourStateChanged {
        peer: PeerHandle,
        state: NeighbourState,
    },
    /// The walk stepped to a new current peer.
    Advanced { from: PeerHandle, to: PeerHandle },
    /// The walk rolled back to an earlier round.
    RolledBack { to: PeerHandle },
    /// The walk restarted from the seed peers.
    Reseeded { seeds: Vec<PeerHandle> },
}
