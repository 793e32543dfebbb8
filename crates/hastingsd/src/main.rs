//! hastingsd — Hastings peer discovery daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use hastings_core::config::HastingsConfig;
use hastings_core::identity::NodeKey;
use hastings_services::{
    CorrelationManager, DiscoveryEvent, DiscoverySettings, HastingsDiscovery, MemoryPeerStore,
    PeerRecordStore, ReputationLedger, StaticSeeds,
};

mod transport;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = HastingsConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = HastingsConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        HastingsConfig::default()
    });

    let listen_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config.network.listen_addr.clone());
    tracing::info!(listen_addr, "hastingsd starting");

    // Bind discovery socket
    let socket = Arc::new(
        UdpSocket::bind(&listen_addr)
            .await
            .context("failed to bind discovery socket")?,
    );
    let local_addr = socket.local_addr()?;
    let advertise_addr = config
        .network
        .advertise_socket_addr()
        .context("invalid network.advertise_addr")?
        .unwrap_or(local_addr);
    if advertise_addr.ip().is_unspecified() {
        tracing::warn!(
            addr = %advertise_addr,
            "no advertise_addr set, peers learn our address from our datagrams"
        );
    }

    // Identity
    let key = NodeKey::load_or_generate(&config.identity.keypair_path)
        .context("failed to load node key")?;
    let own = key.handle(advertise_addr);
    tracing::info!(node = %own, "identity ready");

    let seeds = config
        .discovery
        .seed_handles()
        .context("invalid discovery.seed_peers")?;
    tracing::info!(count = seeds.len(), "seed peers configured");

    // Peer store and reputation
    let peer_store = MemoryPeerStore::with_persistence(config.reputation.store_path.clone())
        .context("failed to load peer store")?;
    tracing::info!(
        path = %config.reputation.store_path.display(),
        peers = peer_store.len(),
        "peer store ready"
    );
    let store: Arc<dyn PeerRecordStore> = Arc::new(peer_store.clone());

    let capacity = config.discovery.channel_capacity;
    let ledger = Arc::new(ReputationLedger::new(store.clone(), capacity));
    let correlation = CorrelationManager::new(
        config.discovery.request_ttl(),
        config.reputation.policy,
        ledger.sender(),
        capacity,
    );

    let (response_tx, response_rx) = mpsc::channel(capacity);
    let (backlog_tx, backlog_rx) = mpsc::channel(capacity);

    let discovery = HastingsDiscovery::new(
        own.clone(),
        Arc::new(transport::UdpMessaging::new(socket.clone(), own.clone(), backlog_tx)),
        Arc::new(StaticSeeds::new(seeds)),
        store.clone(),
        correlation.clone(),
        DiscoverySettings::from_config(&config.discovery),
    );
    let mut discovery_events = discovery.subscribe();

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let outbound_task = tokio::spawn(
        transport::Outbound {
            socket: socket.clone(),
            backlog: backlog_rx,
            shutdown: shutdown_tx.subscribe(),
        }
        .run(),
    );

    let receiver_task = tokio::spawn(
        transport::Receiver {
            socket,
            own,
            store: store.clone(),
            neighbour_count: config.discovery.neighbour_count,
            max_datagram: config.network.max_datagram,
            responses: response_tx,
            shutdown: shutdown_tx.subscribe(),
        }
        .run(),
    );

    let ledger_task = tokio::spawn(ledger.clone().run(shutdown_tx.subscribe()));

    let expiry_task = tokio::spawn(correlation.clone().run(shutdown_tx.subscribe()));

    let flusher_task = tokio::spawn(
        peer_store
            .clone()
            .run_flusher(config.reputation.flush_interval(), shutdown_tx.subscribe()),
    );

    let discovery_task = tokio::spawn(discovery.run(response_rx, shutdown_tx.subscribe()));

    let event_logger = tokio::spawn(async move {
        loop {
            match discovery_events.recv().await {
                Ok(DiscoveryEvent::Reseeded { seeds }) => {
                    tracing::info!(seeds = seeds.len(), "walk restarted from seeds");
                }
                Ok(DiscoveryEvent::RolledBack { to }) => {
                    tracing::debug!(to = to.short(), "walk rolled back");
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "discovery event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let snapshot_printer = {
        let store = store.clone();
        let correlation = correlation.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                tracing::info!(
                    peers = store.len(),
                    pending = correlation.len(),
                    "peer store snapshot"
                );
                for record in store
                    .all()
                    .into_iter()
                    .filter(|r| r.reputation != 0)
                    .take(10)
                {
                    tracing::info!(
                        peer = %record.peer,
                        reputation = record.reputation,
                        last_seen = record.last_seen,
                        "  peer"
                    );
                }
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()   => tracing::info!("shutting down"),
        r = outbound_task        => tracing::error!("send backlog exited: {:?}", r),
        r = receiver_task        => tracing::error!("receiver exited: {:?}", r),
        r = ledger_task          => tracing::error!("reputation ledger exited: {:?}", r),
        r = expiry_task          => tracing::error!("correlation expiry exited: {:?}", r),
        r = flusher_task         => tracing::error!("peer store flusher exited: {:?}", r),
        r = discovery_task       => tracing::error!("discovery walk exited: {:?}", r),
        r = event_logger         => tracing::error!("event logger exited: {:?}", r),
        r = snapshot_printer     => tracing::error!("snapshot printer exited: {:?}", r),
    }

    if let Err(e) = peer_store.flush_if_dirty() {
        tracing::warn!(error = %e, "failed to persist peer store on exit");
    }

    Ok(())
}
