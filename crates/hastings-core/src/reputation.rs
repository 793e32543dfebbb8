//! Reputation events emitted by request/response correlation.
//!
//! The event taxonomy fixes the SIGN of every change:
//! - ResponseMatched:       positive, credited to the responder
//! - NoResponseReceived:    negative, debited from the original recipient
//! - UnCorrelatableMessage: negative, debited from the stated sender
//!
//! Magnitudes come from `ReputationPolicy`, which only holds unsigned values
//! so a misconfigured policy can never flip a sign.

use serde::{Deserialize, Serialize};

use crate::peer::PeerHandle;

/// Why a peer's reputation changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReputationEvent {
    /// A response arrived for a pending request, from the peer it was sent to.
    ResponseMatched,
    /// A pending request expired without a response.
    NoResponseReceived,
    /// A response arrived that matches no pending request from that peer.
    UnCorrelatableMessage,
}

impl ReputationEvent {
    pub fn is_penalty(self) -> bool {
        !matches!(self, ReputationEvent::ResponseMatched)
    }
}

/// A signed score delta for one peer. Ephemeral; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationChange {
    pub peer: PeerHandle,
    pub amount: i64,
    pub reason: ReputationEvent,
}

/// Unsigned magnitudes for each reputation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationPolicy {
    pub response_matched: u32,
    pub no_response_received: u32,
    pub uncorrelatable_message: u32,
}

impl Default for ReputationPolicy {
    fn default() -> Self {
        Self {
            response_matched: 10,
            no_response_received: 10,
            uncorrelatable_message: 100,
        }
    }
}

impl ReputationPolicy {
    /// Signed delta for an event. Zero magnitudes are bumped to 1 so every
    /// event strictly moves the score in its direction.
    pub fn delta(&self, event: ReputationEvent) -> i64 {
        let magnitude = match event {
            ReputationEvent::ResponseMatched => self.response_matched,
            ReputationEvent::NoResponseReceived => self.no_response_received,
            ReputationEvent::UnCorrelatableMessage => self.uncorrelatable_message,
        }
        .max(1) as i64;

        if event.is_penalty() {
            -magnitude
        } else {
            magnitude
        }
    }

    /// Build the change record for `peer`.
    pub fn change(&self, peer: PeerHandle, event: ReputationEvent) -> ReputationChange {
        ReputationChange {
            peer,
            amount: self.delta(event),
            reason: event,
        }
    }
}
