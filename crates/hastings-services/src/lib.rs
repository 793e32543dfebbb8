//! hastings-services — the Hastings random walk: walk state and history,
//! request correlation, reputation ledger and the discovery driver.

pub mod caretaker;
pub mod correlation;
pub mod discovery;
pub mod events;
pub mod memento;
pub mod messaging;
pub mod originator;
pub mod reputation;
pub mod seed;

pub use caretaker::{CareTaker, HistoryError};
pub use correlation::{CorrelationError, CorrelationManager, PendingRequest, RequestKind};
pub use discovery::{DiscoverySettings, HastingsDiscovery, Phase, WalkError};
pub use events::DiscoveryEvent;
pub use memento::{Memento, Neighbour, NeighbourState};
pub use messaging::{InboundResponse, MessagingError, PeerMessaging, ResponseKind};
pub use originator::{CandidateSelector, Originator};
pub use reputation::{MemoryPeerStore, PeerRecord, PeerRecordStore, ReputationLedger, StoreError};
pub use seed::{SeedProvider, StaticSeeds};
