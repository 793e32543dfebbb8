//! Where a walk starts from.

use hastings_core::PeerHandle;

pub trait SeedProvider: Send + Sync {
    /// Peers to start (or restart) a walk from. May be empty.
    fn initial_peers(&self) -> Vec<PeerHandle>;
}

/// Fixed seed list, typically from `discovery.seed_peers`.
#[derive(Debug, Clone, Default)]
pub struct StaticSeeds {
    peers: Vec<PeerHandle>,
}

impl StaticSeeds {
    pub fn new(peers: Vec<PeerHandle>) -> Self {
        Self { peers }
    }
}

impl SeedProvider for StaticSeeds {
    fn initial_peers(&self) -> Vec<PeerHandle> {
        self.peers.clone()
    }
}
