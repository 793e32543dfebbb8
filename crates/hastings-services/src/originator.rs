//! Originator — the mutable state of the walk's current round.
//!
//! Holds the current peer, its neighbours and the correlation id of the
//! outstanding peer-neighbours request (PNR). Every mutation takes
//! `&mut self`; the driver owns the only instance, so two walk steps can
//! never touch it at once.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use hastings_core::{CorrelationId, PeerHandle};

use crate::memento::{Memento, Neighbour, NeighbourState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Originator {
    current_peer: PeerHandle,
    neighbours: Vec<Neighbour>,
    pnr_correlation_id: Option<CorrelationId>,
}

impl Originator {
    /// A round for `peer` with no known neighbours.
    pub fn new(peer: PeerHandle) -> Self {
        Self {
            current_peer: peer,
            neighbours: Vec::new(),
            pnr_correlation_id: None,
        }
    }

    pub fn current_peer(&self) -> &PeerHandle {
        &self.current_peer
    }

    pub fn neighbours(&self) -> &[Neighbour] {
        &self.neighbours
    }

    pub fn neighbour(&self, peer: &PeerHandle) -> Option<&Neighbour> {
        self.neighbours.iter().find(|n| n.peer() == peer)
    }

    pub fn pnr_correlation_id(&self) -> Option<CorrelationId> {
        self.pnr_correlation_id
    }

    pub fn set_pnr_correlation_id(&mut self, id: CorrelationId) {
        self.pnr_correlation_id = Some(id);
    }

    /// Clear the outstanding PNR if it is `id`. Returns whether it was.
    pub fn resolve_pnr(&mut self, id: CorrelationId) -> bool {
        if self.pnr_correlation_id == Some(id) {
            self.pnr_correlation_id = None;
            true
        } else {
            false
        }
    }

    // ── Memento ──────────────────────────────────────────────────────────────

    /// Deep snapshot of the current peer and neighbours.
    pub fn create_memento(&self) -> Memento {
        Memento::new(self.current_peer.clone(), self.neighbours.clone())
    }

    /// Replace the round wholesale with the snapshot. Any in-flight PNR is
    /// abandoned.
    pub fn restore_memento(&mut self, memento: &Memento) {
        self.current_peer = memento.peer().clone();
        self.neighbours = memento.neighbours().to_vec();
        self.pnr_correlation_id = None;
    }

    // ── Round transitions ────────────────────────────────────────────────────

    /// Start a new round at `candidate` with the given neighbours, all
    /// `Unresponsive`. Duplicates and the candidate itself are skipped.
    pub fn set_current_peer(
        &mut self,
        candidate: PeerHandle,
        neighbours: impl IntoIterator<Item = PeerHandle>,
    ) {
        self.current_peer = candidate;
        self.pnr_correlation_id = None;
        self.replace_neighbours(neighbours);
    }

    /// Keep the current peer, replace its neighbours.
    pub fn replace_neighbours(&mut self, neighbours: impl IntoIterator<Item = PeerHandle>) {
        self.neighbours.clear();
        for peer in neighbours {
            if peer == self.current_peer || self.neighbour(&peer).is_some() {
                continue;
            }
            self.neighbours.push(Neighbour::new(peer));
        }
    }

    /// Put every neighbour back to `Unresponsive` for a fresh round of pings.
    pub fn reset_neighbours(&mut self) {
        for n in &mut self.neighbours {
            n.set_state(NeighbourState::Unresponsive);
            n.set_ping_correlation_id(None);
        }
    }

    /// `Unresponsive → Contacted` once a ping has been dispatched.
    pub fn mark_contacted(&mut self, peer: &PeerHandle, ping: CorrelationId) -> bool {
        self.transition(peer, &[NeighbourState::Unresponsive], NeighbourState::Contacted)
            .map(|n| n.set_ping_correlation_id(Some(ping)))
            .is_some()
    }

    /// `Contacted → Responsive` on a matched ping response.
    pub fn mark_neighbour_responsive(&mut self, peer: &PeerHandle) -> bool {
        self.transition(peer, &[NeighbourState::Contacted], NeighbourState::Responsive)
            .is_some()
    }

    /// `Contacted → Unreachable` on ping timeout. A failed dispatch takes
    /// the same path straight from `Unresponsive`.
    pub fn mark_neighbour_unreachable(&mut self, peer: &PeerHandle) -> bool {
        self.transition(
            peer,
            &[NeighbourState::Unresponsive, NeighbourState::Contacted],
            NeighbourState::Unreachable,
        )
        .is_some()
    }

    fn transition(
        &mut self,
        peer: &PeerHandle,
        from: &[NeighbourState],
        to: NeighbourState,
    ) -> Option<&mut Neighbour> {
        let neighbour = self
            .neighbours
            .iter_mut()
            .find(|n| n.peer() == peer && from.contains(&n.state()))?;
        neighbour.set_state(to);
        Some(neighbour)
    }

    /// The neighbour a ping correlation id was sent to.
    pub fn neighbour_for_ping(&self, id: CorrelationId) -> Option<&PeerHandle> {
        self.neighbours
            .iter()
            .find(|n| n.ping_correlation_id() == Some(id))
            .map(|n| n.peer())
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    /// True iff at least one neighbour is `Responsive`.
    pub fn has_valid_candidate(&self) -> bool {
        self.neighbours
            .iter()
            .any(|n| n.state() == NeighbourState::Responsive)
    }

    /// Every neighbour has reached a terminal state and no PNR is pending.
    pub fn is_round_complete(&self) -> bool {
        self.pnr_correlation_id.is_none()
            && self.neighbours.iter().all(|n| n.state().is_terminal())
    }

    pub fn responsive(&self) -> impl Iterator<Item = &PeerHandle> {
        self.neighbours
            .iter()
            .filter(|n| n.state() == NeighbourState::Responsive)
            .map(|n| n.peer())
    }

    /// Correlation ids this round still waits on.
    pub fn outstanding(&self) -> impl Iterator<Item = CorrelationId> + '_ {
        self.pnr_correlation_id.into_iter().chain(
            self.neighbours
                .iter()
                .filter(|n| n.state() == NeighbourState::Contacted)
                .filter_map(|n| n.ping_correlation_id()),
        )
    }
}

// ── Candidate selection ───────────────────────────────────────────────────────

/// Picks the next current peer among responsive neighbours.
///
/// Candidates are sorted by `PeerHandle` before the draw, so a seeded
/// selector makes the same choice whatever order responses arrived in.
pub enum CandidateSelector {
    Random(StdRng),
    /// Always the smallest handle.
    Lexicographic,
}

impl CandidateSelector {
    pub fn from_entropy() -> Self {
        Self::Random(StdRng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self::Random(StdRng::seed_from_u64(seed))
    }

    /// From an optional configured seed.
    pub fn from_seed(seed: Option<u64>) -> Self {
        seed.map(Self::seeded).unwrap_or_else(Self::from_entropy)
    }

    pub fn select(&mut self, originator: &Originator) -> Option<PeerHandle> {
        let mut candidates: Vec<&PeerHandle> = originator.responsive().collect();
        candidates.sort();
        match self {
            CandidateSelector::Random(rng) => candidates.choose(rng).map(|p| (*p).clone()),
            CandidateSelector::Lexicographic => candidates.first().map(|p| (*p).clone()),
        }
    }
}
