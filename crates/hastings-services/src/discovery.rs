//! HastingsDiscovery — drives the random walk.
//!
//! One walk round per current peer:
//!
//!   Contact ──▶ Awaiting (neighbours request) ──▶ Pinging ──▶ Evaluate
//!      ▲                                                       │
//!      └──── advance (push memento) / rollback (pop memento) ──┘
//!
//! The driver owns the `Originator` and `CareTaker` outright and is the
//! only task that touches them. Responses, evictions and deadlines reach it
//! through one `select!` loop, so walk steps are strictly sequential.
//!
//! The seed round is a round whose current peer is this node and whose
//! neighbours are the seed peers. Rolling back to it re-pings the seeds.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use hastings_core::config::DiscoveryConfig;
use hastings_core::{CorrelationId, PeerHandle};

use crate::caretaker::{CareTaker, HistoryError};
use crate::correlation::{CorrelationManager, PendingRequest, RequestKind};
use crate::events::DiscoveryEvent;
use crate::memento::NeighbourState;
use crate::messaging::{InboundResponse, PeerMessaging, ResponseKind};
use crate::originator::{CandidateSelector, Originator};
use crate::reputation::{PeerRecord, PeerRecordStore};
use crate::seed::SeedProvider;

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    /// Longest a round may take before it is evaluated anyway.
    pub round_timeout: Duration,
    /// Distinct peers seen before anything is stored.
    pub burn_in: usize,
    /// Wait before re-seeding when the seeds yield nothing.
    pub reseed_backoff: Duration,
    /// Mementos kept for rollback. 0 = unbounded.
    pub max_history: usize,
    pub event_capacity: usize,
    pub rng_seed: Option<u64>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self::from_config(&DiscoveryConfig::default())
    }
}

impl DiscoverySettings {
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self {
            round_timeout: config.round_timeout(),
            burn_in: config.burn_in,
            reseed_backoff: config.reseed_backoff(),
            max_history: config.max_history,
            event_capacity: config.channel_capacity,
            rng_seed: config.rng_seed,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WalkError {
    #[error("no responsive candidate left in the walk history")]
    NoValidCandidate(#[from] HistoryError),
    #[error("seed provider returned no peers")]
    SeedExhausted,
}

/// Where the current round stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Waiting for the current peer's neighbours.
    Awaiting,
    /// Waiting for neighbour pings.
    Pinging,
    /// Seeds came back empty; waiting to re-seed.
    Backoff,
}

enum Step {
    Contact,
    Evaluate,
    Reseed,
    Done,
}

pub struct HastingsDiscovery {
    own_node: PeerHandle,
    messaging: Arc<dyn PeerMessaging>,
    seeds: Arc<dyn SeedProvider>,
    store: Arc<dyn PeerRecordStore>,
    correlation: CorrelationManager,
    evictions: broadcast::Receiver<PendingRequest>,
    events: broadcast::Sender<DiscoveryEvent>,
    originator: Originator,
    history: CareTaker,
    selector: CandidateSelector,
    settings: DiscoverySettings,
    phase: Phase,
    round_deadline: Option<Instant>,
    // Correlation ids this driver registered and has not seen resolved.
    in_flight: HashSet<CorrelationId>,
    // Distinct peers seen since the last re-seed, for burn-in.
    walk_seen: HashSet<PeerHandle>,
}

impl HastingsDiscovery {
    pub fn new(
        own_node: PeerHandle,
        messaging: Arc<dyn PeerMessaging>,
        seeds: Arc<dyn SeedProvider>,
        store: Arc<dyn PeerRecordStore>,
        correlation: CorrelationManager,
        settings: DiscoverySettings,
    ) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        Self {
            originator: Originator::new(own_node.clone()),
            own_node,
            messaging,
            seeds,
            store,
            evictions: correlation.subscribe_evictions(),
            correlation,
            events,
            history: CareTaker::with_capacity(settings.max_history),
            selector: CandidateSelector::from_seed(settings.rng_seed),
            settings,
            phase: Phase::Idle,
            round_deadline: None,
            in_flight: HashSet::new(),
            walk_seen: HashSet::new(),
        }
    }

    pub fn with_selector(mut self, selector: CandidateSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    pub fn own_node(&self) -> &PeerHandle {
        &self.own_node
    }

    pub fn originator(&self) -> &Originator {
        &self.originator
    }

    pub fn history(&self) -> &CareTaker {
        &self.history
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn round_deadline(&self) -> Option<Instant> {
        self.round_deadline
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Walk until shutdown or until the response stream closes.
    pub async fn run(
        mut self,
        mut responses: mpsc::Receiver<InboundResponse>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        tracing::info!(node = self.own_node.short(), "discovery walk starting");
        self.start();

        let mut status = tokio::time::interval(STATUS_INTERVAL);

        loop {
            let deadline = self.round_deadline;
            tokio::select! {
                _ = shutdown.recv() => {
                    self.abandon_in_flight();
                    tracing::info!("discovery walk shutting down");
                    return Ok(());
                }

                response = responses.recv() => {
                    let Some(response) = response else {
                        self.abandon_in_flight();
                        tracing::info!("response stream closed, discovery walk stopping");
                        return Ok(());
                    };
                    self.handle_response(response).await;
                }

                eviction = self.evictions.recv() => match eviction {
                    Ok(request) => self.handle_eviction(request),
                    // Lost evictions are covered by the round deadline
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "eviction stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },

                _ = sleep_until(deadline) => self.on_deadline(),

                _ = status.tick() => {
                    tracing::info!(
                        current = self.originator.current_peer().short(),
                        depth = self.history.len(),
                        phase = ?self.phase,
                        in_flight = self.in_flight.len(),
                        known_peers = self.store.len(),
                        "walk status"
                    );
                }
            }
        }
    }

    /// Begin (or restart) the walk from the seed peers.
    pub fn start(&mut self) {
        self.drive(Step::Reseed);
    }

    /// Feed one transport response into the walk.
    pub async fn handle_response(&mut self, response: InboundResponse) {
        let id = response.correlation_id;
        // Uncorrelatable responses are penalised by the correlation manager
        let Some(pending) = self.correlation.match_response(id, &response.sender).await else {
            return;
        };
        self.in_flight.remove(&id);

        let next = match pending.kind {
            RequestKind::Ping => self.on_pong(id),
            RequestKind::PeerNeighbours => {
                let peers = match response.kind {
                    ResponseKind::Neighbours(peers) => peers,
                    ResponseKind::Pong => {
                        tracing::debug!(
                            peer = response.sender.short(),
                            "neighbours request answered with a pong"
                        );
                        Vec::new()
                    }
                };
                self.on_neighbours(id, peers)
            }
        };
        self.drive(next);
    }

    /// Feed one TTL eviction into the walk. Requests this driver did not
    /// issue are ignored.
    pub fn handle_eviction(&mut self, request: PendingRequest) {
        let id = request.correlation_id;
        if !self.in_flight.remove(&id) {
            return;
        }

        let next = match request.kind {
            RequestKind::PeerNeighbours => {
                if self.originator.resolve_pnr(id) {
                    tracing::debug!(
                        peer = request.recipient.short(),
                        "neighbours request timed out"
                    );
                    self.pnr_failed()
                } else {
                    Step::Done
                }
            }
            RequestKind::Ping => {
                let Some(peer) = self.originator.neighbour_for_ping(id).cloned() else {
                    return;
                };
                if self.originator.mark_neighbour_unreachable(&peer) {
                    self.emit_state(&peer, NeighbourState::Unreachable);
                }
                self.after_ping_outcome()
            }
        };
        self.drive(next);
    }

    /// The round deadline passed: evaluate whatever we have, or re-seed
    /// after a backoff.
    pub fn on_deadline(&mut self) {
        self.round_deadline = None;
        let next = match self.phase {
            Phase::Backoff => Step::Reseed,
            Phase::Idle => Step::Done,
            Phase::Awaiting | Phase::Pinging => {
                tracing::debug!(
                    current = self.originator.current_peer().short(),
                    "round timed out"
                );
                match self.originator.pnr_correlation_id() {
                    Some(id) => {
                        self.originator.resolve_pnr(id);
                        self.pnr_failed()
                    }
                    None => Step::Evaluate,
                }
            }
        };
        self.drive(next);
    }

    fn drive(&mut self, mut step: Step) {
        let mut reseeded = false;
        loop {
            step = match step {
                Step::Done => return,
                Step::Contact => self.contact(),
                Step::Evaluate => self.evaluate(),
                Step::Reseed if reseeded => {
                    self.enter_backoff();
                    return;
                }
                Step::Reseed => {
                    reseeded = true;
                    match self.reseed() {
                        Ok(()) => Step::Contact,
                        Err(e) => {
                            tracing::warn!(error = %e, "cannot seed the walk");
                            self.enter_backoff();
                            return;
                        }
                    }
                }
            };
        }
    }

    fn reseed(&mut self) -> Result<(), WalkError> {
        self.abandon_in_flight();
        self.history.clear();
        self.walk_seen.clear();

        let seeds = self.seeds.initial_peers();
        self.originator = Originator::new(self.own_node.clone());
        self.originator.replace_neighbours(seeds.iter().cloned());
        if self.originator.neighbours().is_empty() {
            return Err(WalkError::SeedExhausted);
        }

        self.history.add(self.originator.create_memento());
        tracing::info!(seeds = seeds.len(), "walk seeded");
        self.emit(DiscoveryEvent::Reseeded { seeds });
        Ok(())
    }

    fn enter_backoff(&mut self) {
        self.phase = Phase::Backoff;
        self.round_deadline = Some(Instant::now() + self.settings.reseed_backoff);
        tracing::info!(
            backoff_ms = self.settings.reseed_backoff.as_millis() as u64,
            "walk suspended, re-seeding after backoff"
        );
    }

    fn contact(&mut self) -> Step {
        self.round_deadline = Some(Instant::now() + self.settings.round_timeout);

        if *self.originator.current_peer() == self.own_node {
            self.originator.reset_neighbours();
            self.phase = Phase::Pinging;
            self.ping_neighbours();
            return self.after_ping_outcome();
        }

        let target = self.originator.current_peer().clone();
        let sent = match self.messaging.send_neighbours_request(&target) {
            Ok(id) => self.register(id, &target, RequestKind::PeerNeighbours).then_some(id),
            Err(e) => {
                tracing::debug!(peer = target.short(), error = %e, "neighbours request not sent");
                None
            }
        };

        match sent {
            Some(id) => {
                self.originator.set_pnr_correlation_id(id);
                self.phase = Phase::Awaiting;
                Step::Done
            }
            None => self.pnr_failed(),
        }
    }

    fn on_neighbours(&mut self, id: CorrelationId, peers: Vec<PeerHandle>) -> Step {
        if !self.originator.resolve_pnr(id) {
            tracing::debug!(correlation_id = %id, "stale neighbours response");
            return Step::Done;
        }

        let own = &self.own_node;
        self.originator
            .replace_neighbours(peers.into_iter().filter(|p| p != own));
        tracing::debug!(
            current = self.originator.current_peer().short(),
            neighbours = self.originator.neighbours().len(),
            "neighbours received"
        );

        self.phase = Phase::Pinging;
        self.ping_neighbours();
        self.after_ping_outcome()
    }

    fn on_pong(&mut self, id: CorrelationId) -> Step {
        let Some(peer) = self.originator.neighbour_for_ping(id).cloned() else {
            tracing::debug!(correlation_id = %id, "stale ping response");
            return Step::Done;
        };
        if self.originator.mark_neighbour_responsive(&peer) {
            self.emit_state(&peer, NeighbourState::Responsive);
        }
        self.after_ping_outcome()
    }

    // A peer that does not answer its neighbours request offers no
    // candidates, whatever a restored snapshot said.
    fn pnr_failed(&mut self) -> Step {
        self.originator.replace_neighbours(std::iter::empty());
        Step::Evaluate
    }

    fn after_ping_outcome(&self) -> Step {
        if self.originator.is_round_complete() {
            Step::Evaluate
        } else {
            Step::Done
        }
    }

    fn ping_neighbours(&mut self) {
        let targets: Vec<PeerHandle> = self
            .originator
            .neighbours()
            .iter()
            .filter(|n| n.state() == NeighbourState::Unresponsive)
            .map(|n| n.peer().clone())
            .collect();

        for peer in targets {
            let sent = match self.messaging.send_ping(&peer) {
                Ok(id) => self.register(id, &peer, RequestKind::Ping).then_some(id),
                Err(e) => {
                    tracing::debug!(peer = peer.short(), error = %e, "ping not sent");
                    None
                }
            };
            match sent {
                Some(id) => {
                    self.originator.mark_contacted(&peer, id);
                    self.emit_state(&peer, NeighbourState::Contacted);
                }
                None => {
                    self.originator.mark_neighbour_unreachable(&peer);
                    self.emit_state(&peer, NeighbourState::Unreachable);
                }
            }
        }
    }

    fn evaluate(&mut self) -> Step {
        self.round_deadline = None;

        if !self.originator.has_valid_candidate() {
            return match self.rollback() {
                Ok(()) => Step::Contact,
                Err(e) => {
                    tracing::info!(error = %e, "walk exhausted, re-seeding");
                    Step::Reseed
                }
            };
        }

        self.store_discovered();
        self.history.add(self.originator.create_memento());

        let Some(next) = self.selector.select(&self.originator) else {
            return Step::Reseed;
        };
        let from = self.originator.current_peer().clone();
        self.originator.set_current_peer(next.clone(), std::iter::empty());

        tracing::debug!(
            from = from.short(),
            to = next.short(),
            depth = self.history.len(),
            "walk advanced"
        );
        self.emit(DiscoveryEvent::Advanced { from, to: next });
        Step::Contact
    }

    fn rollback(&mut self) -> Result<(), WalkError> {
        let memento = self.history.get()?;
        self.originator.restore_memento(&memento);

        let to = memento.peer().clone();
        tracing::debug!(to = to.short(), depth = self.history.len(), "walk rolled back");
        self.emit(DiscoveryEvent::RolledBack { to });
        Ok(())
    }

    fn store_discovered(&mut self) {
        let responsive: Vec<PeerHandle> = self.originator.responsive().cloned().collect();
        for peer in responsive {
            if peer == self.own_node {
                continue;
            }
            self.walk_seen.insert(peer.clone());
            if self.walk_seen.len() <= self.settings.burn_in {
                continue;
            }
            if self.store.add(PeerRecord::discovered(peer.clone())) {
                tracing::info!(peer = %peer, "peer discovered");
                self.emit(DiscoveryEvent::Discovered(peer));
            }
        }
    }

    fn register(&mut self, id: CorrelationId, peer: &PeerHandle, kind: RequestKind) -> bool {
        let registered = self
            .correlation
            .add_pending_request(PendingRequest::new(id, peer.clone(), kind));
        debug_assert!(registered.is_ok(), "messaging reused a pending correlation id");
        match registered {
            Ok(()) => {
                self.in_flight.insert(id);
                true
            }
            Err(e) => {
                tracing::error!(error = %e, peer = peer.short(), "dispatch abandoned");
                false
            }
        }
    }

    fn abandon_in_flight(&mut self) {
        for id in self.in_flight.drain() {
            self.correlation.cancel(id);
        }
    }

    fn emit_state(&self, peer: &PeerHandle, state: NeighbourState) {
        self.emit(DiscoveryEvent::NeighbourStateChanged {
            peer: peer.clone(),
            state,
        });
    }

    fn emit(&self, event: DiscoveryEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
