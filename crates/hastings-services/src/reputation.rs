//! Reputation ledger and peer record store.
//!
//! The ledger consumes `ReputationChange`s from any number of producers and
//! applies them to the peer store. It only scores peers the store already
//! knows: an unknown peer's change is dropped, never turned into a record.
//! Read-modify-write on records is serialized by one ledger-wide lock.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;

use hastings_core::{PeerHandle, ReputationChange, ReputationEvent};

/// A known peer with its score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer: PeerHandle,
    pub reputation: i64,
    /// Unix time in milliseconds of the last matched response.
    pub last_seen: u64,
}

impl PeerRecord {
    /// A freshly discovered peer: neutral score, seen now.
    pub fn discovered(peer: PeerHandle) -> Self {
        Self {
            peer,
            reputation: 0,
            last_seen: unix_millis(),
        }
    }
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Where peer records live.
pub trait PeerRecordStore: Send + Sync {
    fn get(&self, peer: &PeerHandle) -> Option<PeerRecord>;

    /// Insert or replace a record.
    fn update(&self, record: PeerRecord);

    /// Insert a record unless the peer is already known. Returns true if
    /// inserted.
    fn add(&self, record: PeerRecord) -> bool;

    fn all(&self) -> Vec<PeerRecord>;

    fn len(&self) -> usize {
        self.all().len()
    }

    /// Up to `limit` peers, best reputation first, ties by handle order.
    fn best(&self, limit: usize, exclude: &PeerHandle) -> Vec<PeerHandle> {
        let mut records: Vec<PeerRecord> = self
            .all()
            .into_iter()
            .filter(|r| r.peer != *exclude)
            .collect();
        records.sort_by(|a, b| b.reputation.cmp(&a.reputation).then_with(|| a.peer.cmp(&b.peer)));
        records.into_iter().take(limit).map(|r| r.peer).collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, serde_json::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize peer records: {0}")]
    SerializeFailed(serde_json::Error),
}

/// In-memory peer store, optionally persisted as JSON.
///
/// Mutations only mark the store dirty. `flush` (or the `run_flusher` task)
/// writes the full record set to a temp file and renames it over the persist
/// path, one writer at a time. Clones share the same records.
#[derive(Clone, Default)]
pub struct MemoryPeerStore {
    records: Arc<DashMap<PeerHandle, PeerRecord>>,
    persist_path: Arc<Option<PathBuf>>,
    dirty: Arc<AtomicBool>,
    write_lock: Arc<Mutex<()>>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store backed by `path`. Loads existing records; a missing file is an
    /// empty store.
    pub fn with_persistence(path: PathBuf) -> Result<Self, StoreError> {
        let store = Self {
            persist_path: Arc::new(Some(path)),
            ..Self::default()
        };
        store.load_from_disk()?;
        Ok(store)
    }

    /// True when records changed since the last successful flush.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Write all records to disk now. Blocking.
    pub fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = self.persist_path.as_ref() else {
            self.dirty.store(false, Ordering::Release);
            return Ok(());
        };
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        // Cleared before the snapshot: a mutation racing with us re-marks it
        self.dirty.store(false, Ordering::Release);
        let result = self.write_snapshot(path);
        if result.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        result
    }

    /// Flush only if something changed. Returns true if a write happened.
    pub fn flush_if_dirty(&self) -> Result<bool, StoreError> {
        if !self.is_dirty() {
            return Ok(false);
        }
        self.flush().map(|()| true)
    }

    /// Periodically write changed records until shutdown, then once more.
    pub async fn run_flusher(
        self,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    self.flush_blocking().await;
                    tracing::debug!("peer store flusher shutting down");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if self.is_dirty() {
                        self.flush_blocking().await;
                    }
                }
            }
        }
    }

    async fn flush_blocking(&self) {
        let store = self.clone();
        match tokio::task::spawn_blocking(move || store.flush_if_dirty()).await {
            Ok(Ok(true)) => tracing::trace!(peers = self.records.len(), "peer records flushed"),
            Ok(Ok(false)) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "failed to persist peer records"),
            Err(e) => tracing::warn!(error = %e, "peer store flush task failed"),
        }
    }

    fn write_snapshot(&self, path: &Path) -> Result<(), StoreError> {
        let mut snapshot = self.all();
        snapshot.sort_by(|a, b| a.peer.cmp(&b.peer));
        let json = serde_json::to_string_pretty(&snapshot).map_err(StoreError::SerializeFailed)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::WriteFailed(path.to_path_buf(), e))?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| StoreError::WriteFailed(tmp.clone(), e))?;
        std::fs::rename(&tmp, path).map_err(|e| StoreError::WriteFailed(path.to_path_buf(), e))
    }

    fn mark_dirty(&self) {
        if self.persist_path.is_some() {
            self.dirty.store(true, Ordering::Release);
        }
    }

    fn load_from_disk(&self) -> Result<(), StoreError> {
        let Some(path) = self.persist_path.as_ref() else {
            return Ok(());
        };
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::ReadFailed(path.clone(), e)),
        };
        let records: Vec<PeerRecord> =
            serde_json::from_str(&text).map_err(|e| StoreError::ParseFailed(path.clone(), e))?;
        let loaded = records.len();
        for record in records {
            self.records.insert(record.peer.clone(), record);
        }
        if loaded > 0 {
            tracing::info!(count = loaded, path = %path.display(), "loaded persisted peer records");
        }
        Ok(())
    }
}

impl PeerRecordStore for MemoryPeerStore {
    fn get(&self, peer: &PeerHandle) -> Option<PeerRecord> {
        self.records.get(peer).map(|r| r.value().clone())
    }

    fn update(&self, record: PeerRecord) {
        self.records.insert(record.peer.clone(), record);
        self.mark_dirty();
    }

    fn add(&self, record: PeerRecord) -> bool {
        let inserted = match self.records.entry(record.peer.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
        };
        if inserted {
            self.mark_dirty();
        }
        inserted
    }

    fn all(&self) -> Vec<PeerRecord> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

/// Applies reputation changes to a peer store.
pub struct ReputationLedger {
    store: Arc<dyn PeerRecordStore>,
    lock: Mutex<()>,
    applied: broadcast::Sender<ReputationChange>,
    tx: mpsc::Sender<ReputationChange>,
    rx: tokio::sync::Mutex<mpsc::Receiver<ReputationChange>>,
}

impl ReputationLedger {
    /// `capacity` bounds the inbound queue and the applied-change stream.
    pub fn new(store: Arc<dyn PeerRecordStore>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (applied, _) = broadcast::channel(capacity);
        Self {
            store,
            lock: Mutex::new(()),
            applied,
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// A producer handle. Every producer's changes merge into one queue.
    pub fn sender(&self) -> mpsc::Sender<ReputationChange> {
        self.tx.clone()
    }

    /// Changes that were applied to a known record.
    pub fn subscribe(&self) -> broadcast::Receiver<ReputationChange> {
        self.applied.subscribe()
    }

    /// Apply one change. Returns the new score, or None when the peer is
    /// unknown and nothing happened.
    pub fn on_next(&self, change: &ReputationChange) -> Option<i64> {
        let score = {
            let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
            let mut record = self.store.get(&change.peer)?;
            record.reputation = record.reputation.saturating_add(change.amount);
            if change.reason == ReputationEvent::ResponseMatched {
                record.last_seen = unix_millis();
            }
            let score = record.reputation;
            self.store.update(record);
            score
        };

        tracing::trace!(
            peer = change.peer.short(),
            amount = change.amount,
            reason = ?change.reason,
            score,
            "reputation applied"
        );
        let _ = self.applied.send(change.clone());
        Some(score)
    }

    /// Drain the inbound queue until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let mut rx = self.rx.lock().await;
        tracing::info!(peers = self.store.len(), "reputation ledger starting");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("reputation ledger shutting down");
                    return Ok(());
                }
                change = rx.recv() => {
                    let Some(change) = change else {
                        return Ok(());
                    };
                    if self.on_next(&change).is_none() {
                        tracing::trace!(
                            peer = change.peer.short(),
                            "reputation change for unknown peer ignored"
                        );
                    }
                }
            }
        }
    }
}
