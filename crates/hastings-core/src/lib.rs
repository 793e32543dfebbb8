//! hastings-core — shared identifiers, reputation types, datagram format and
//! configuration. All other Hastings crates depend on this one.

pub mod config;
pub mod identity;
pub mod peer;
pub mod reputation;
pub mod wire;

pub use peer::{CorrelationId, PeerHandle};
pub use reputation::{ReputationChange, ReputationEvent, ReputationPolicy};
