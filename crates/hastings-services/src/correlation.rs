//! Request/response correlation with TTL eviction.
//!
//! Every outgoing ping or neighbours request is registered here under its
//! correlation id. A response either matches its pending entry (credited to
//! the responder) or is uncorrelatable (debited from the sender). Entries
//! nobody answers are evicted when their TTL passes and the original
//! recipient is debited.
//!
//! The table is a `DashMap`, so unrelated requests never contend on a
//! global lock. Matching and eviction both remove through `remove_if`; the
//! first remover wins and the loser sees nothing, so each id produces at
//! most one of {match, eviction}.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::Instant;

use hastings_core::{
    CorrelationId, PeerHandle, ReputationChange, ReputationEvent, ReputationPolicy,
};

/// How long the expiry loop sleeps when nothing is pending.
const IDLE_POLL: Duration = Duration::from_secs(1);

type DeadlineHeap = BinaryHeap<Reverse<(Instant, CorrelationId)>>;

/// What a pending request asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Ping,
    PeerNeighbours,
}

/// An outstanding request, owned by the correlation table until it is
/// matched, evicted or cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub correlation_id: CorrelationId,
    pub recipient: PeerHandle,
    pub kind: RequestKind,
    pub sent_at: Instant,
}

impl PendingRequest {
    /// A request sent to `recipient` just now.
    pub fn new(correlation_id: CorrelationId, recipient: PeerHandle, kind: RequestKind) -> Self {
        Self {
            correlation_id,
            recipient,
            kind,
            sent_at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    #[error("correlation id {0} is already pending")]
    DuplicateCorrelationId(CorrelationId),
}

struct Pending {
    request: PendingRequest,
    expires_at: Instant,
}

struct Inner {
    pending: DashMap<CorrelationId, Pending>,
    // Min-heap of (deadline, id). May hold ids that were already matched;
    // eviction re-checks the table.
    deadlines: Mutex<DeadlineHeap>,
    deadline_added: Notify,
    ttl: Duration,
    policy: ReputationPolicy,
    reputation_tx: mpsc::Sender<ReputationChange>,
    reputation_events: broadcast::Sender<ReputationChange>,
    evictions: broadcast::Sender<PendingRequest>,
}

/// Shared correlation table. Cheap to clone.
#[derive(Clone)]
pub struct CorrelationManager {
    inner: Arc<Inner>,
}

impl CorrelationManager {
    /// `reputation_tx` feeds the reputation ledger; `capacity` sizes the
    /// eviction and reputation broadcast streams.
    pub fn new(
        ttl: Duration,
        policy: ReputationPolicy,
        reputation_tx: mpsc::Sender<ReputationChange>,
        capacity: usize,
    ) -> Self {
        let (reputation_events, _) = broadcast::channel(capacity.max(1));
        let (evictions, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                pending: DashMap::new(),
                deadlines: Mutex::new(BinaryHeap::new()),
                deadline_added: Notify::new(),
                ttl,
                policy,
                reputation_tx,
                reputation_events,
                evictions,
            }),
        }
    }

    /// Register a request. Its TTL runs from `request.sent_at`.
    pub fn add_pending_request(&self, request: PendingRequest) -> Result<(), CorrelationError> {
        let id = request.correlation_id;
        let expires_at = request.sent_at + self.inner.ttl;

        match self.inner.pending.entry(id) {
            Entry::Occupied(_) => return Err(CorrelationError::DuplicateCorrelationId(id)),
            Entry::Vacant(slot) => {
                slot.insert(Pending {
                    request,
                    expires_at,
                });
            }
        }

        self.deadlines().push(Reverse((expires_at, id)));
        self.inner.deadline_added.notify_one();
        Ok(())
    }

    /// Match a response against the table.
    ///
    /// Returns the pending request when `responder` is the peer it was sent
    /// to. A known id answered by the wrong peer stays pending; the wrong
    /// peer is debited exactly as for an unknown id.
    pub async fn match_response(
        &self,
        id: CorrelationId,
        responder: &PeerHandle,
    ) -> Option<PendingRequest> {
        let matched = self
            .inner
            .pending
            .remove_if(&id, |_, p| p.request.recipient == *responder);

        match matched {
            Some((_, pending)) => {
                self.emit(responder.clone(), ReputationEvent::ResponseMatched).await;
                Some(pending.request)
            }
            None => {
                tracing::debug!(
                    correlation_id = %id,
                    peer = responder.short(),
                    "uncorrelatable response"
                );
                self.emit(responder.clone(), ReputationEvent::UnCorrelatableMessage)
                    .await;
                None
            }
        }
    }

    pub async fn try_match_response(&self, id: CorrelationId, responder: &PeerHandle) -> bool {
        self.match_response(id, responder).await.is_some()
    }

    /// Evict every entry whose deadline is at or before `now`.
    ///
    /// Each evicted request debits its recipient once and is published on
    /// the eviction stream.
    pub async fn evict_expired(&self, now: Instant) -> Vec<PendingRequest> {
        let due: Vec<CorrelationId> = {
            let mut heap = self.deadlines();
            let mut due = Vec::new();
            while let Some(Reverse((at, id))) = heap.peek().copied() {
                if at > now {
                    break;
                }
                heap.pop();
                due.push(id);
            }
            due
        };

        let mut evicted = Vec::new();
        for id in due {
            let Some((_, pending)) = self.inner.pending.remove_if(&id, |_, p| p.expires_at <= now)
            else {
                continue;
            };
            self.emit(pending.request.recipient.clone(), ReputationEvent::NoResponseReceived)
                .await;
            // No subscriber is fine: the driver may not be running.
            let _ = self.inner.evictions.send(pending.request.clone());
            evicted.push(pending.request);
        }
        evicted
    }

    /// Drop a pending entry without any reputation effect. Used when the
    /// owner abandons the request (shutdown, forced re-seed).
    pub fn cancel(&self, id: CorrelationId) -> Option<PendingRequest> {
        self.inner.pending.remove(&id).map(|(_, p)| p.request)
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.inner.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.pending.is_empty()
    }

    /// Earliest deadline still queued, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines().peek().map(|Reverse((at, _))| *at)
    }

    /// Requests evicted for lack of a response.
    pub fn subscribe_evictions(&self) -> broadcast::Receiver<PendingRequest> {
        self.inner.evictions.subscribe()
    }

    /// Every reputation change this manager emits.
    pub fn subscribe_reputation(&self) -> broadcast::Receiver<ReputationChange> {
        self.inner.reputation_events.subscribe()
    }

    /// Evict expired entries until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        tracing::info!(
            ttl_ms = self.inner.ttl.as_millis() as u64,
            "correlation expiry loop starting"
        );

        loop {
            let sleep = match self.next_deadline() {
                Some(at) => tokio::time::sleep_until(at),
                None => tokio::time::sleep(IDLE_POLL),
            };

            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(pending = self.len(), "correlation expiry loop shutting down");
                    return Ok(());
                }

                // A new deadline may be earlier than the one we sleep on
                _ = self.inner.deadline_added.notified() => {}

                _ = sleep => {
                    let evicted = self.evict_expired(Instant::now()).await;
                    if !evicted.is_empty() {
                        tracing::debug!(count = evicted.len(), "evicted expired requests");
                    }
                }
            }
        }
    }

    async fn emit(&self, peer: PeerHandle, event: ReputationEvent) {
        let change = self.inner.policy.change(peer, event);
        let _ = self.inner.reputation_events.send(change.clone());
        if self.inner.reputation_tx.send(change).await.is_err() {
            tracing::debug!("reputation ledger gone, change dropped");
        }
    }

    fn deadlines(&self) -> MutexGuard<'_, DeadlineHeap> {
        self.inner
            .deadlines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    const TTL: Duration = Duration::from_millis(100);

    fn peer(port: u16) -> PeerHandle {
        PeerHandle::new(SocketAddr::from(([127, 0, 0, 1], port)), &port.to_be_bytes())
    }

    fn manager() -> (CorrelationManager, mpsc::Receiver<ReputationChange>) {
        let (tx, rx) = mpsc::channel(64);
        (CorrelationManager::new(TTL, ReputationPolicy::default(), tx, 64), rx)
    }

    fn ping(to: u16) -> PendingRequest {
        PendingRequest::new(CorrelationId::generate(), peer(to), RequestKind::Ping)
    }

    #[tokio::test]
    async fn matching_response_credits_responder() {
        let (cm, mut rx) = manager();
        let req = ping(2);
        let id = req.correlation_id;
        cm.add_pending_request(req).unwrap();

        assert!(cm.try_match_response(id, &peer(2)).await);
        assert!(!cm.contains(&id));

        let change = rx.try_recv().unwrap();
        assert_eq!(change.peer, peer(2));
        assert_eq!(change.reason, ReputationEvent::ResponseMatched);
        assert!(change.amount > 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected_without_overwrite() {
        let (cm, _rx) = manager();
        let req = ping(2);
        let id = req.correlation_id;
        cm.add_pending_request(req).unwrap();

        let clash = PendingRequest::new(id, peer(3), RequestKind::PeerNeighbours);
        assert_eq!(
            cm.add_pending_request(clash),
            Err(CorrelationError::DuplicateCorrelationId(id))
        );
        // Original entry untouched: only peer 2 can match it
        assert!(cm.try_match_response(id, &peer(2)).await);
    }

    #[tokio::test]
    async fn wrong_responder_keeps_entry_and_is_debited() {
        let (cm, mut rx) = manager();
        let req = ping(2);
        let id = req.correlation_id;
        cm.add_pending_request(req).unwrap();

        assert!(!cm.try_match_response(id, &peer(3)).await);
        assert!(cm.contains(&id));

        let change = rx.try_recv().unwrap();
        assert_eq!(change.peer, peer(3));
        assert_eq!(change.reason, ReputationEvent::UnCorrelatableMessage);
        assert!(change.amount < 0);
    }

    #[tokio::test]
    async fn unknown_id_is_uncorrelatable() {
        let (cm, mut rx) = manager();
        let mut events = cm.subscribe_reputation();

        assert!(!cm.try_match_response(CorrelationId::generate(), &peer(4)).await);

        let change = rx.try_recv().unwrap();
        assert_eq!(change.peer, peer(4));
        assert_eq!(change.reason, ReputationEvent::UnCorrelatableMessage);
        assert_eq!(events.try_recv().unwrap(), change);
    }

    #[tokio::test]
    async fn eviction_debits_recipient_after_ttl() {
        let (cm, mut rx) = manager();
        let mut evictions = cm.subscribe_evictions();
        let req = ping(5);
        let sent_at = req.sent_at;
        cm.add_pending_request(req.clone()).unwrap();

        assert!(cm.evict_expired(sent_at + TTL / 2).await.is_empty());
        assert!(cm.contains(&req.correlation_id));

        let evicted = cm.evict_expired(sent_at + TTL).await;
        assert_eq!(evicted, vec![req.clone()]);
        assert!(cm.is_empty());
        assert_eq!(evictions.try_recv().unwrap(), req);

        let change = rx.try_recv().unwrap();
        assert_eq!(change.peer, peer(5));
        assert_eq!(change.reason, ReputationEvent::NoResponseReceived);
        assert!(change.amount < 0);

        // A late response is no longer correlatable
        assert!(!cm.try_match_response(req.correlation_id, &peer(5)).await);
        assert_eq!(rx.try_recv().unwrap().reason, ReputationEvent::UnCorrelatableMessage);
    }

    #[tokio::test]
    async fn matched_entry_is_not_evicted_later() {
        let (cm, mut rx) = manager();
        let req = ping(6);
        let sent_at = req.sent_at;
        cm.add_pending_request(req.clone()).unwrap();
        assert!(cm.try_match_response(req.correlation_id, &peer(6)).await);

        assert!(cm.evict_expired(sent_at + TTL * 2).await.is_empty());
        assert_eq!(rx.try_recv().unwrap().reason, ReputationEvent::ResponseMatched);
        assert!(rx.try_recv().is_err());
        assert_eq!(cm.next_deadline(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn match_and_eviction_race_resolves_once() {
        let (tx, mut rx) = mpsc::channel(4096);
        let cm = CorrelationManager::new(Duration::ZERO, ReputationPolicy::default(), tx, 4096);

        let mut ids = Vec::new();
        for port in 0..200u16 {
            let req = ping(port);
            ids.push((req.correlation_id, req.recipient.clone(), req.sent_at));
            cm.add_pending_request(req).unwrap();
        }

        let mut tasks = Vec::new();
        for (id, recipient, sent_at) in ids {
            let matcher = cm.clone();
            tasks.push(tokio::spawn(async move {
                matcher.try_match_response(id, &recipient).await;
            }));
            let evictor = cm.clone();
            tasks.push(tokio::spawn(async move {
                evictor.evict_expired(sent_at).await;
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        drop(cm);

        let mut resolved = std::collections::HashMap::new();
        while let Ok(change) = rx.try_recv() {
            if change.reason != ReputationEvent::UnCorrelatableMessage {
                *resolved.entry(change.peer).or_insert(0) += 1;
            }
        }
        assert_eq!(resolved.len(), 200);
        assert!(resolved.values().all(|n| *n == 1));
    }

    #[tokio::test]
    async fn cancel_removes_silently() {
        let (cm, mut rx) = manager();
        let req = ping(7);
        cm.add_pending_request(req.clone()).unwrap();

        assert_eq!(cm.cancel(req.correlation_id), Some(req.clone()));
        assert!(cm.evict_expired(req.sent_at + TTL).await.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn expiry_loop_evicts_on_its_own() {
        let (cm, mut rx) = manager();
        let mut evictions = cm.subscribe_evictions();
        let (shutdown_tx, _) = broadcast::channel(1);
        let task = tokio::spawn(cm.clone().run(shutdown_tx.subscribe()));

        let req = ping(8);
        cm.add_pending_request(req.clone()).unwrap();

        let evicted = tokio::time::timeout(Duration::from_secs(2), evictions.recv())
            .await
            .expect("eviction within 2s")
            .unwrap();
        assert_eq!(evicted, req);
        assert_eq!(rx.recv().await.unwrap().reason, ReputationEvent::NoResponseReceived);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
