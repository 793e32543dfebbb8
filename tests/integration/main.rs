//! Hastings integration test harness.
//!
//! Tests in this crate run a real discovery walk (driver, correlation
//! manager with its expiry loop, reputation ledger) against an in-process
//! simulated network:
//!
//!   cargo test --test integration
//!
//! Only the walking node runs a driver. Every other node is a passive
//! entry in `SimNetwork` that answers pings and neighbours requests after
//! a short delay, unless it is dead (silently drops) or rogue (answers
//! with correlation ids nobody asked for).

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use hastings_core::{CorrelationId, PeerHandle, ReputationPolicy};
use hastings_services::{
    CorrelationManager, DiscoveryEvent, DiscoverySettings, HastingsDiscovery,
    InboundResponse, MemoryPeerStore, MessagingError, PeerMessaging, PeerRecord,
    PeerRecordStore, ReputationLedger, ResponseKind, StaticSeeds,
};

mod failures;
mod infra;
mod walk;

// ── Simulated network ─────────────────────────────────────────────────────────

/// Handle of simulated node `i`.
pub fn node(i: u16) -> PeerHandle {
    PeerHandle::new(
        SocketAddr::from(([10, 0, (i >> 8) as u8, i as u8], 7470)),
        &i.to_be_bytes(),
    )
}

/// The walking node.
pub fn walker_handle() -> PeerHandle {
    PeerHandle::new(SocketAddr::from(([10, 255, 0, 1], 7470)), b"walker")
}

#[derive(Default)]
struct Topology {
    neighbours: HashMap<PeerHandle, Vec<PeerHandle>>,
    dead: HashSet<PeerHandle>,
    rogue: HashSet<PeerHandle>,
}

pub struct SimNetwork {
    topology: Mutex<Topology>,
    latency: Duration,
}

impl SimNetwork {
    pub fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            topology: Mutex::new(Topology::default()),
            latency,
        })
    }

    /// `n` nodes where node `i` knows the next `k` nodes around the ring.
    pub fn ring(n: u16, k: u16, latency: Duration) -> Arc<Self> {
        let net = Self::new(latency);
        for i in 0..n {
            net.set_neighbours(i, &(1..=k).map(|d| (i + d) % n).collect::<Vec<_>>());
        }
        net
    }

    /// `n` nodes that all know each other.
    pub fn clique(n: u16, latency: Duration) -> Arc<Self> {
        let net = Self::new(latency);
        for i in 0..n {
            net.set_neighbours(i, &(0..n).filter(|j| *j != i).collect::<Vec<_>>());
        }
        net
    }

    pub fn set_neighbours(&self, i: u16, neighbours: &[u16]) {
        self.topology
            .lock()
            .unwrap()
            .neighbours
            .insert(node(i), neighbours.iter().map(|j| node(*j)).collect());
    }

    pub fn kill(&self, i: u16) {
        self.topology.lock().unwrap().dead.insert(node(i));
    }

    pub fn revive(&self, i: u16) {
        self.topology.lock().unwrap().dead.remove(&node(i));
    }

    pub fn make_rogue(&self, i: u16) {
        self.topology.lock().unwrap().rogue.insert(node(i));
    }

    /// Messaging endpoint for the walking node. Responses land on `responses`.
    pub fn endpoint(
        self: &Arc<Self>,
        responses: mpsc::Sender<InboundResponse>,
    ) -> Arc<SimMessaging> {
        Arc::new(SimMessaging {
            net: self.clone(),
            responses,
        })
    }

    fn answer(&self, peer: &PeerHandle, neighbours_request: bool) -> Option<(bool, ResponseKind)> {
        let topo = self.topology.lock().unwrap();
        if topo.dead.contains(peer) || !topo.neighbours.contains_key(peer) {
            return None;
        }
        let kind = if neighbours_request {
            ResponseKind::Neighbours(topo.neighbours.get(peer).cloned().unwrap_or_default())
        } else {
            ResponseKind::Pong
        };
        Some((topo.rogue.contains(peer), kind))
    }
}

pub struct SimMessaging {
    net: Arc<SimNetwork>,
    responses: mpsc::Sender<InboundResponse>,
}

impl SimMessaging {
    fn dispatch(
        &self,
        peer: &PeerHandle,
        neighbours_request: bool,
    ) -> Result<CorrelationId, MessagingError> {
        let correlation_id = CorrelationId::generate();
        let Some((rogue, kind)) = self.net.answer(peer, neighbours_request) else {
            // Lost in transit; the TTL takes care of it
            return Ok(correlation_id);
        };

        let response = InboundResponse {
            correlation_id: if rogue {
                CorrelationId::generate()
            } else {
                correlation_id
            },
            sender: peer.clone(),
            kind,
        };
        let tx = self.responses.clone();
        let latency = self.net.latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            let _ = tx.send(response).await;
        });
        Ok(correlation_id)
    }
}

impl PeerMessaging for SimMessaging {
    fn send_neighbours_request(&self, peer: &PeerHandle) -> Result<CorrelationId, MessagingError> {
        self.dispatch(peer, true)
    }

    fn send_ping(&self, peer: &PeerHandle) -> Result<CorrelationId, MessagingError> {
        self.dispatch(peer, false)
    }
}

// ── Walking node ──────────────────────────────────────────────────────────────

pub struct WalkerConfig {
    pub seeds: Vec<u16>,
    pub known: Vec<u16>,
    pub ttl: Duration,
    pub settings: DiscoverySettings,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            seeds: vec![0],
            known: Vec::new(),
            ttl: Duration::from_millis(200),
            settings: DiscoverySettings {
                round_timeout: Duration::from_secs(2),
                burn_in: 0,
                reseed_backoff: Duration::from_millis(200),
                rng_seed: Some(7),
                ..DiscoverySettings::default()
            },
        }
    }
}

/// A running walk with everything a test wants to look at.
pub struct Walker {
    pub store: MemoryPeerStore,
    pub correlation: CorrelationManager,
    pub events: broadcast::Receiver<DiscoveryEvent>,
    pub reputation: broadcast::Receiver<hastings_core::ReputationChange>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<anyhow::Result<()>>>,
}

impl Walker {
    pub fn spawn(net: &Arc<SimNetwork>, config: WalkerConfig) -> Self {
        let store = MemoryPeerStore::new();
        for i in &config.known {
            store.add(PeerRecord {
                peer: node(*i),
                reputation: 0,
                last_seen: 0,
            });
        }
        let shared: Arc<dyn PeerRecordStore> = Arc::new(store.clone());

        let ledger = Arc::new(ReputationLedger::new(shared.clone(), 1024));
        let correlation =
            CorrelationManager::new(config.ttl, ReputationPolicy::default(), ledger.sender(), 1024);
        let reputation = correlation.subscribe_reputation();

        let (response_tx, response_rx) = mpsc::channel(1024);
        let discovery = HastingsDiscovery::new(
            walker_handle(),
            net.endpoint(response_tx),
            Arc::new(StaticSeeds::new(config.seeds.iter().map(|i| node(*i)).collect())),
            shared,
            correlation.clone(),
            config.settings,
        );
        let events = discovery.subscribe();

        let (shutdown, _) = broadcast::channel(1);
        let tasks = vec![
            tokio::spawn(ledger.run(shutdown.subscribe())),
            tokio::spawn(correlation.clone().run(shutdown.subscribe())),
            tokio::spawn(discovery.run(response_rx, shutdown.subscribe())),
        ];

        Self {
            store,
            correlation,
            events,
            reputation,
            shutdown,
            tasks,
        }
    }

    /// Wait for an event matching `pred`, skipping others.
    pub async fn wait_for(
        &mut self,
        timeout: Duration,
        pred: impl Fn(&DiscoveryEvent) -> bool,
    ) -> Option<DiscoveryEvent> {
        let events = &mut self.events;
        tokio::time::timeout(timeout, async {
            loop {
                match events.recv().await {
                    Ok(e) if pred(&e) => return Some(e),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    pub fn reputation_of(&self, i: u16) -> Option<i64> {
        self.store.get(&node(i)).map(|r| r.reputation)
    }

    /// Stop every task and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        for task in self.tasks {
            task.await.expect("task panicked").expect("task failed");
        }
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
